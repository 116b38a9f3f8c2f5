use bytes::BytesMut;
use tikcon_protocol::{
	AUTH_FAILED_ID, DEFAULT_MAX_PAYLOAD_SIZE, FramingError, Packet, decode_packet, encode_packet, encode_packet_into,
	packet_type, try_decode_packet_from_buffer,
};

#[test]
fn coalesced_packets_decode_in_order() {
	let first = Packet::new(1, packet_type::AUTH_RESPONSE, "");
	let second = Packet::new(2, packet_type::RESPONSE_VALUE, "Summoned new Zombie");

	let mut buf = BytesMut::new();
	encode_packet_into(&mut buf, &first, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode first");
	encode_packet_into(&mut buf, &second, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode second");

	let a = try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)
		.expect("ok")
		.expect("first packet");
	let b = try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)
		.expect("ok")
		.expect("second packet");

	assert_eq!(a, first);
	assert_eq!(b, second);
	assert!(buf.is_empty());
}

#[test]
fn decode_packet_reports_consumed_bytes_with_trailing_data() {
	let packet = Packet::new(9, packet_type::EXEC_COMMAND, "time set day");
	let mut frame = encode_packet(&packet, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");
	let frame_len = frame.len();
	frame.extend_from_slice(&[1, 2, 3]);

	let (decoded, consumed) = decode_packet(&frame, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode");
	assert_eq!(consumed, frame_len);
	assert_eq!(decoded.body, "time set day");
}

#[test]
fn auth_failure_id_is_preserved() {
	let packet = Packet::new(AUTH_FAILED_ID, packet_type::AUTH_RESPONSE, "");
	let frame = encode_packet(&packet, DEFAULT_MAX_PAYLOAD_SIZE).expect("encode");

	let (decoded, _) = decode_packet(&frame, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode");
	assert_eq!(decoded.id, AUTH_FAILED_ID);
}

#[test]
fn oversized_length_prefix_is_rejected_before_buffering() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&((DEFAULT_MAX_PAYLOAD_SIZE + 11) as i32).to_le_bytes());

	let err = try_decode_packet_from_buffer(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
	match err {
		FramingError::PayloadTooLarge { len, max } => assert!(len > max),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn non_utf8_body_is_decoded_lossily() {
	let mut frame = encode_packet(&Packet::new(3, packet_type::RESPONSE_VALUE, "ab"), DEFAULT_MAX_PAYLOAD_SIZE)
		.expect("encode");
	frame[12] = 0xff;

	let (decoded, _) = decode_packet(&frame, DEFAULT_MAX_PAYLOAD_SIZE).expect("decode");
	assert_eq!(decoded.body, "\u{fffd}b");
}
