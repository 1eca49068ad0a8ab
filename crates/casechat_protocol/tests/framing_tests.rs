use bytes::BytesMut;
use casechat_domain::{DocumentId, RoomId};
use casechat_protocol::{
	ClientCommand, DEFAULT_MAX_FRAME_SIZE, FramingError, ServerEvent, decode_frame, encode_frame, encode_frame_default,
	encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

#[test]
fn command_frame_roundtrip_slice() {
	let cmd = ClientCommand::SendMessage {
		room_id: RoomId(7),
		text: "안녕하세요".to_string(),
	};

	let frame = encode_frame(&cmd, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<ClientCommand>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, cmd);
}

#[test]
fn encode_frame_default_matches_explicit_default_limit() {
	let cmd = ClientCommand::ResolveRoom {
		document_id: DocumentId(42),
	};

	let a = encode_frame_default(&cmd).expect("encode_frame_default");
	let b = encode_frame(&cmd, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");

	assert_eq!(a, b);
}

#[test]
fn decode_requires_full_frame() {
	let ev = ServerEvent::JoinedRoom { room_id: RoomId(1) };
	let frame = encode_frame_default(&ev).expect("encode");

	let err = decode_frame::<ServerEvent>(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::InsufficientData { need, have } => {
			assert!(need > have);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn try_decode_from_buffer_incremental() {
	let cmd = ClientCommand::Auth {
		credential_token: "v1.payload.sig".to_string(),
	};
	let frame = encode_frame_default(&cmd).expect("encode");

	let mut buf = BytesMut::new();

	buf.extend_from_slice(&frame[..2]);
	assert!(
		try_decode_frame_from_buffer::<ClientCommand>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[2..8]);
	assert!(
		try_decode_frame_from_buffer::<ClientCommand>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[8..]);
	let decoded = try_decode_frame_from_buffer::<ClientCommand>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");

	assert_eq!(decoded, cmd);
	assert!(buf.is_empty());
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let ev1 = ServerEvent::JoinedRoom { room_id: RoomId(1) };
	let ev2 = ServerEvent::LeftRoom { room_id: RoomId(1) };

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &ev1, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into ev1");
	encode_frame_into(&mut buf, &ev2, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into ev2");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (d1, used1) = decode_frame::<ServerEvent>(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode ev1");
	assert_eq!(d1, ev1);

	let (d2, used2) = decode_frame::<ServerEvent>(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode ev2");
	assert_eq!(d2, ev2);

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn frame_len_helper_is_correct() {
	let cmd = ClientCommand::Ping { client_time_unix_ms: 123 };

	let payload_len = serde_json::to_vec(&cmd).expect("json").len();
	let frame = encode_frame_default(&cmd).expect("encode");

	assert_eq!(frame_len_from_payload_len(payload_len), frame.len());
}

#[test]
fn encode_rejects_too_large() {
	let cmd = ClientCommand::SendMessage {
		room_id: RoomId(1),
		text: "a".repeat(10_000),
	};

	let err = encode_frame(&cmd, 32).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn decode_rejects_too_large_prefix() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_decode_frame_from_buffer::<ServerEvent>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn arbitrary_text_survives_framing(text in "\\PC{0,512}", room in 0u64..1_000_000) {
		let cmd = ClientCommand::SendMessage { room_id: RoomId(room), text };
		let frame = encode_frame_default(&cmd).unwrap();
		let (decoded, consumed) = decode_frame::<ClientCommand>(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap();
		prop_assert_eq!(consumed, frame.len());
		prop_assert_eq!(decoded, cmd);
	}

	#[test]
	fn split_at_any_point_decodes_once_complete(split in 0usize..64) {
		let cmd = ClientCommand::Ping { client_time_unix_ms: 42 };
		let frame = encode_frame_default(&cmd).unwrap();
		let split = split.min(frame.len());

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&frame[..split]);
		let first = try_decode_frame_from_buffer::<ClientCommand>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
		if split < frame.len() {
			prop_assert!(first.is_none());
			buf.extend_from_slice(&frame[split..]);
			let second = try_decode_frame_from_buffer::<ClientCommand>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
			prop_assert_eq!(second, Some(cmd));
		} else {
			prop_assert_eq!(first, Some(cmd));
		}
		prop_assert!(buf.is_empty());
	}
}
