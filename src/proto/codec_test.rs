use std::sync::atomic::AtomicU16;
use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use super::*;
use crate::constants::PROTO_REV_2_0;
use crate::constants::PROTO_REV_3_0;
use crate::ProtocolError;

fn codec(rev: u16) -> MessageCodec {
    MessageCodec::new(Arc::new(AtomicU16::new(rev)), None)
}

fn encode(
    codec: &mut MessageCodec,
    msg: Arc<Message>,
) -> BytesMut {
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).unwrap();
    buf
}

#[test]
fn test_uleb128_encoding() {
    let mut buf = BytesMut::new();
    write_uleb128(&mut buf, 0);
    assert_eq!(&buf[..], &[0x00]);

    let mut buf = BytesMut::new();
    write_uleb128(&mut buf, 624485);
    assert_eq!(&buf[..], &[0xE5, 0x8E, 0x26]);
}

#[test]
fn test_entry_assign_layout_rev3() {
    let mut c = codec(PROTO_REV_3_0);
    let msg = Message::entry_assign(
        "ab",
        0x0102,
        SequenceNumber::new(0x0304),
        Arc::new(Value::Boolean(true)),
        0x01,
    );
    let buf = encode(&mut c, msg);
    assert_eq!(
        &buf[..],
        &[0x10, 0x02, b'a', b'b', 0x00, 0x01, 0x02, 0x03, 0x04, 0x01, 0x01]
    );
}

#[test]
fn test_entry_assign_layout_rev2_has_u16_string_and_no_flags() {
    let mut c = codec(PROTO_REV_2_0);
    let msg = Message::entry_assign(
        "ab",
        1,
        SequenceNumber::new(2),
        Arc::new(Value::Boolean(false)),
        0x01,
    );
    let buf = encode(&mut c, msg);
    assert_eq!(
        &buf[..],
        &[0x10, 0x00, 0x02, b'a', b'b', 0x00, 0x00, 0x01, 0x00, 0x02, 0x00]
    );
}

#[test]
fn test_decode_waits_for_complete_message() {
    let mut c = codec(PROTO_REV_3_0);
    let full = encode(
        &mut c,
        Message::entry_update(7, SequenceNumber::new(9), Arc::new(Value::Double(1.5))),
    );

    let mut partial = BytesMut::from(&full[..full.len() - 3]);
    assert!(c.decode(&mut partial).unwrap().is_none());
    assert_eq!(partial.len(), full.len() - 3, "nothing consumed on short read");

    partial.extend_from_slice(&full[full.len() - 3..]);
    let msg = c.decode(&mut partial).unwrap().unwrap();
    assert_eq!(
        *msg,
        Message::EntryUpdate {
            id: 7,
            seq_num: SequenceNumber::new(9),
            value: Arc::new(Value::Double(1.5)),
        }
    );
    assert!(partial.is_empty());
}

#[test]
fn test_decode_multiple_messages_from_one_buffer() {
    let mut c = codec(PROTO_REV_3_0);
    let mut buf = encode(&mut c, Arc::new(Message::KeepAlive));
    buf.extend_from_slice(&encode(&mut c, Message::flags_update(3, 1)));
    buf.extend_from_slice(&encode(&mut c, Message::clear_entries()));

    assert_eq!(*c.decode(&mut buf).unwrap().unwrap(), Message::KeepAlive);
    assert_eq!(
        *c.decode(&mut buf).unwrap().unwrap(),
        Message::FlagsUpdate { id: 3, flags: 1 }
    );
    assert_eq!(*c.decode(&mut buf).unwrap().unwrap(), Message::ClearEntries);
    assert!(c.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_string_array_and_raw_values_decode() {
    let mut c = codec(PROTO_REV_3_0);
    let value = Value::StringArray(vec!["x".into(), "yz".into()]);
    let mut buf = encode(
        &mut c,
        Message::entry_assign("s", 1, SequenceNumber::new(1), Arc::new(value.clone()), 0),
    );
    buf.extend_from_slice(&encode(&mut c, Message::execute_rpc(4, 5, vec![9, 8, 7])));

    match &*c.decode(&mut buf).unwrap().unwrap() {
        Message::EntryAssign { value: v, .. } => assert_eq!(**v, value),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        *c.decode(&mut buf).unwrap().unwrap(),
        Message::ExecuteRpc {
            id: 4,
            call_uid: 5,
            params: vec![9, 8, 7]
        }
    );
}

#[test]
fn test_unknown_message_type_is_protocol_error() {
    let mut c = codec(PROTO_REV_3_0);
    let mut buf = BytesMut::from(&[0x7Fu8][..]);
    assert!(matches!(
        c.decode(&mut buf),
        Err(ProtocolError::UnknownMessageType(0x7F))
    ));
}

#[test]
fn test_bad_clear_magic_is_protocol_error() {
    let mut c = codec(PROTO_REV_3_0);
    let mut buf = BytesMut::from(&[0x14u8, 0, 0, 0, 1][..]);
    assert!(matches!(
        c.decode(&mut buf),
        Err(ProtocolError::BadClearMagic(1))
    ));
}

#[test]
fn test_rev3_only_message_rejected_on_rev2_stream() {
    let mut c = codec(PROTO_REV_2_0);
    let mut buf = BytesMut::from(&[0x13u8, 0, 1][..]);
    assert!(matches!(
        c.decode(&mut buf),
        Err(ProtocolError::UnsupportedMessage { msg_type: 0x13, .. })
    ));
}

#[test]
fn test_rev3_only_message_skipped_when_encoding_for_rev2() {
    let mut c = codec(PROTO_REV_2_0);
    let buf = encode(&mut c, Message::entry_delete(5));
    assert!(buf.is_empty());
}

#[test]
fn test_raw_value_dropped_when_encoding_for_rev2() {
    let mut c = codec(PROTO_REV_2_0);
    let buf = encode(
        &mut c,
        Message::entry_update(1, SequenceNumber::new(1), Arc::new(Value::Raw(vec![1]))),
    );
    assert!(buf.is_empty());
}

#[test]
fn test_rev2_update_uses_type_lookup() {
    let lookup: EntryTypeLookup = Arc::new(|id| (id == 2).then_some(ValueType::Double));
    let mut c = MessageCodec::new(Arc::new(AtomicU16::new(PROTO_REV_2_0)), Some(lookup));

    let mut buf = encode(
        &mut c,
        Message::entry_update(2, SequenceNumber::new(3), Arc::new(Value::Double(4.0))),
    );
    match &*c.decode(&mut buf).unwrap().unwrap() {
        Message::EntryUpdate { value, .. } => assert_eq!(**value, Value::Double(4.0)),
        other => panic!("unexpected {other:?}"),
    }

    let mut unknown = encode(
        &mut c,
        Message::entry_update(9, SequenceNumber::new(3), Arc::new(Value::Double(4.0))),
    );
    assert!(matches!(
        c.decode(&mut unknown),
        Err(ProtocolError::UnknownEntryId(9))
    ));
}

#[test]
fn test_client_hello_identity_follows_requested_revision() {
    let mut c = codec(PROTO_REV_3_0);
    let mut buf = encode(
        &mut c,
        Arc::new(Message::ClientHello {
            proto_rev: PROTO_REV_2_0,
            identity: "ignored".into(),
        }),
    );
    assert_eq!(&buf[..], &[0x01, 0x02, 0x00]);
    assert_eq!(
        *c.decode(&mut buf).unwrap().unwrap(),
        Message::ClientHello {
            proto_rev: PROTO_REV_2_0,
            identity: String::new()
        }
    );
}

#[test]
fn test_revision_change_applies_to_next_message() {
    let rev = Arc::new(AtomicU16::new(PROTO_REV_3_0));
    let mut c = MessageCodec::new(rev.clone(), None);
    rev.store(PROTO_REV_2_0, std::sync::atomic::Ordering::Release);
    let buf = encode(&mut c, Message::flags_update(1, 1));
    assert!(buf.is_empty());
}

#[test]
fn test_rev2_long_string_truncated_on_char_boundary() {
    let mut c = codec(PROTO_REV_2_0);
    // 'é' is two bytes; 32768 of them straddle the u16 length limit
    let name = "é".repeat(32768);
    let mut buf = encode(
        &mut c,
        Message::entry_assign(&name, 1, SequenceNumber::new(1), Arc::new(Value::Boolean(true)), 0),
    );
    assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 65534);

    match &*c.decode(&mut buf).unwrap().unwrap() {
        Message::EntryAssign { name: decoded, .. } => {
            assert_eq!(decoded.chars().count(), 32767);
            assert!(decoded.chars().all(|ch| ch == 'é'));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(buf.is_empty());
}
