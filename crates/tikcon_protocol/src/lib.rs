#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{
	DEFAULT_MAX_PAYLOAD_SIZE, FramingError, Packet, decode_packet, encode_packet, encode_packet_into,
	packet_len_from_body_len, try_decode_packet_from_buffer,
};

/// RCON packet type constants.
pub mod packet_type {
	/// Server reply carrying command output.
	pub const RESPONSE_VALUE: i32 = 0;
	/// Client command execution request.
	pub const EXEC_COMMAND: i32 = 2;
	/// Server reply to an auth request (shares the value of `EXEC_COMMAND`).
	pub const AUTH_RESPONSE: i32 = 2;
	/// Client login request carrying the password.
	pub const AUTH: i32 = 3;
}

/// Request id the server echoes when authentication fails.
pub const AUTH_FAILED_ID: i32 = -1;
