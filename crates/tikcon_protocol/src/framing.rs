#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Default maximum body size accepted in either direction.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 4096;

/// id + type + two trailing NUL bytes.
const FIXED_PART_LEN: usize = 4 + 4 + 2;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("packet body exceeds maximum size: len={len} max={max}")]
	PayloadTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("invalid packet length prefix: {0}")]
	InvalidLength(i32),

	#[error("packet is missing its NUL terminators")]
	MissingTerminator,
}

/// A single RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
	pub id: i32,
	pub kind: i32,
	pub body: String,
}

impl Packet {
	pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
		Self {
			id,
			kind,
			body: body.into(),
		}
	}
}

/// Compute total packet length on the wire (prefix + id + type + body + terminators).
#[inline]
pub fn packet_len_from_body_len(body_len: usize) -> usize {
	4 + FIXED_PART_LEN + body_len
}

/// Encode a packet into a little-endian, length-prefixed frame.
pub fn encode_packet(packet: &Packet, max_payload_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut buf = BytesMut::with_capacity(packet_len_from_body_len(packet.body.len()));
	encode_packet_into(&mut buf, packet, max_payload_size)?;
	Ok(buf.to_vec())
}

/// Append an encoded packet into the provided buffer.
pub fn encode_packet_into(buf: &mut BytesMut, packet: &Packet, max_payload_size: usize) -> Result<(), FramingError> {
	let body = packet.body.as_bytes();
	if body.len() > max_payload_size {
		return Err(FramingError::PayloadTooLarge {
			len: body.len(),
			max: max_payload_size,
		});
	}

	buf.reserve(packet_len_from_body_len(body.len()));
	buf.put_i32_le((FIXED_PART_LEN + body.len()) as i32);
	buf.put_i32_le(packet.id);
	buf.put_i32_le(packet.kind);
	buf.put_slice(body);
	buf.put_u8(0);
	buf.put_u8(0);
	Ok(())
}

fn read_len_prefix(src: &[u8], max_payload_size: usize) -> Result<usize, FramingError> {
	let raw = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
	if raw < FIXED_PART_LEN as i32 {
		return Err(FramingError::InvalidLength(raw));
	}
	let len = raw as usize;
	if len - FIXED_PART_LEN > max_payload_size {
		return Err(FramingError::PayloadTooLarge {
			len: len - FIXED_PART_LEN,
			max: max_payload_size,
		});
	}
	Ok(len)
}

fn parse_packet_body(mut frame: &[u8]) -> Result<Packet, FramingError> {
	let id = frame.get_i32_le();
	let kind = frame.get_i32_le();

	let Some(body) = frame.strip_suffix(&[0, 0]) else {
		return Err(FramingError::MissingTerminator);
	};

	Ok(Packet {
		id,
		kind,
		body: String::from_utf8_lossy(body).into_owned(),
	})
}

/// Decode a single packet from the start of `src`.
pub fn decode_packet(src: &[u8], max_payload_size: usize) -> Result<(Packet, usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = read_len_prefix(src, max_payload_size)?;
	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let packet = parse_packet_body(&src[4..need])?;
	Ok((packet, need))
}

/// Try to decode a single packet from a growable buffer.
pub fn try_decode_packet_from_buffer(buf: &mut BytesMut, max_payload_size: usize) -> Result<Option<Packet>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = read_len_prefix(buf, max_payload_size)?;
	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	parse_packet_body(&frame[4..]).map(Some)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet_type;

	#[test]
	fn auth_packet_has_expected_wire_layout() {
		let packet = Packet::new(7, packet_type::AUTH, "pw");
		let frame = encode_packet(&packet, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");

		assert_eq!(frame.len(), packet_len_from_body_len(2));
		assert_eq!(&frame[0..4], &12i32.to_le_bytes());
		assert_eq!(&frame[4..8], &7i32.to_le_bytes());
		assert_eq!(&frame[8..12], &3i32.to_le_bytes());
		assert_eq!(&frame[12..14], b"pw");
		assert_eq!(&frame[14..], &[0, 0]);
	}

	#[test]
	fn decode_requires_full_frame() {
		let packet = Packet::new(1, packet_type::EXEC_COMMAND, "list");
		let frame = encode_packet(&packet, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");

		let err = decode_packet(&frame[..6], DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert!(need > have);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn try_decode_from_buffer_incremental() {
		let packet = Packet::new(42, packet_type::RESPONSE_VALUE, "There are 0 of a max of 20 players online");
		let frame = encode_packet(&packet, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");

		let mut buf = BytesMut::new();

		buf.extend_from_slice(&frame[..3]);
		assert!(
			try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&frame[3..10]);
		assert!(
			try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&frame[10..]);
		let decoded = try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(decoded, packet);
		assert!(buf.is_empty());
	}

	#[test]
	fn encode_rejects_too_large() {
		let packet = Packet::new(1, packet_type::EXEC_COMMAND, "a".repeat(100));

		let err = encode_packet(&packet, 32).unwrap_err();
		match err {
			FramingError::PayloadTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decode_rejects_short_length_prefix() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&4i32.to_le_bytes());
		buf.extend_from_slice(&[0; 4]);

		let err = try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::InvalidLength(4)));
	}

	#[test]
	fn decode_rejects_missing_terminator() {
		let mut frame = encode_packet(&Packet::new(1, 0, "ok"), DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");
		let last = frame.len() - 1;
		frame[last] = b'!';

		let err = decode_packet(&frame, DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::MissingTerminator));
	}
}
