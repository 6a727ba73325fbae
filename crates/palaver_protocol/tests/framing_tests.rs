use bytes::BytesMut;
use palaver_domain::{Role, RoomId, UserId};
use palaver_protocol::{
	ClientFrame, DEFAULT_MAX_FRAME_SIZE, FramingError, MessageEvent, ServerFrame, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

fn message_frame(content: &str) -> ServerFrame {
	ServerFrame::Message(MessageEvent {
		id: uuid::Uuid::new_v4(),
		content: content.to_string(),
		username: "alice".to_string(),
		role: Role::User,
		created_at: chrono::Utc::now(),
		room_id: Some(RoomId::new_v4()),
		recipient_id: None,
	})
}

#[test]
fn server_frame_roundtrip_through_framing() {
	let frame = message_frame("hello there");
	let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<ServerFrame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, bytes.len());
	assert_eq!(decoded, frame);
}

#[test]
fn client_command_stream_decodes_incrementally() {
	let hello = ClientFrame::Hello {
		token: "v1.payload.sig".to_string(),
	};
	let join = ClientFrame::JoinRoom { room_id: RoomId::new_v4() };
	let dm = ClientFrame::SendMessage {
		room_id: None,
		recipient_id: Some(UserId::new_v4()),
		content: "psst".to_string(),
	};

	let mut wire = Vec::new();
	wire.extend_from_slice(&encode_frame_default(&hello).expect("encode"));
	wire.extend_from_slice(&encode_frame_default(&join).expect("encode"));
	wire.extend_from_slice(&encode_frame_default(&dm).expect("encode"));

	// Feed the concatenated stream one byte at a time.
	let mut buf = BytesMut::new();
	let mut decoded = Vec::new();
	for byte in wire {
		buf.extend_from_slice(&[byte]);
		while let Some(frame) = try_decode_frame_from_buffer::<ClientFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok") {
			decoded.push(frame);
		}
	}

	assert_eq!(decoded, vec![hello, join, dm]);
	assert!(buf.is_empty());
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let first = ClientFrame::ListRooms;
	let second = ClientFrame::ListUsers;

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &first, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into first");
	encode_frame_into(&mut buf, &second, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into second");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (d1, used1) = decode_frame::<ClientFrame>(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode first");
	assert_eq!(d1, first);

	let (d2, used2) = decode_frame::<ClientFrame>(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode second");
	assert_eq!(d2, second);

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn oversized_message_is_rejected_on_encode() {
	let frame = message_frame(&"a".repeat(4096));
	let err = encode_frame(&frame, 64).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => assert!(len > max),
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn arbitrary_content_roundtrips(content in "\\PC{0,512}", split in 1usize..64) {
		let frame = message_frame(&content);
		let bytes = encode_frame_default(&frame).expect("encode");

		let mut buf = BytesMut::new();
		let mut out = None;
		for chunk in bytes.chunks(split) {
			buf.extend_from_slice(chunk);
			if let Some(decoded) = try_decode_frame_from_buffer::<ServerFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok") {
				out = Some(decoded);
			}
		}

		prop_assert_eq!(out.expect("frame decoded"), frame);
	}
}
