use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::constants::PROTO_REV_2_0;
use crate::constants::PROTO_REV_3_0;
use crate::constants::UNASSIGNED_ID;
use crate::network::ConnectionHandle;
use crate::network::ConnectionState;
use crate::network::Handshake;
use crate::proto::Message;
use crate::proto::SequenceNumber;
use crate::proto::Value;
use crate::test_utils::storage_with_queue;
use crate::test_utils::FakeConnection;
use crate::test_utils::ScriptedChannel;

fn hello(
    proto_rev: u16,
    identity: &str,
) -> Arc<Message> {
    Arc::new(Message::ClientHello {
        proto_rev,
        identity: identity.to_string(),
    })
}

fn server_hello(identity: &str) -> Arc<Message> {
    Arc::new(Message::ServerHello {
        flags: 0,
        identity: identity.to_string(),
    })
}

fn x_assign() -> Arc<Message> {
    Message::entry_assign("x", 0, SequenceNumber::new(1), Arc::new(Value::Double(1.0)), 0)
}

fn recorder() -> (ReconnectHook, Arc<Mutex<Vec<u16>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let hook_calls = calls.clone();
    (Arc::new(move |rev| hook_calls.lock().push(rev)), calls)
}

#[tokio::test]
async fn test_server_handshake_v3_exchanges_snapshots() {
    let (storage, queue) = storage_with_queue(true);
    storage.set_entry_value("x", Value::Double(1.0)).unwrap();
    let handshake = ServerHandshake::new("srv".into(), storage.clone());

    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![
        hello(PROTO_REV_3_0, "client-a"),
        Message::unassigned_entry("from_client", SequenceNumber::new(1), Arc::new(Value::Double(2.0)), 0),
        Arc::new(Message::KeepAlive),
        Arc::new(Message::ClientHelloDone),
    ]);

    assert!(handshake.handshake(&conn.handle(), &mut channel).await);
    assert_eq!(
        channel.sent,
        vec![server_hello("srv"), x_assign(), Arc::new(Message::ServerHelloDone)]
    );
    assert_eq!(conn.remote_id(), "client-a");
    assert_eq!(conn.proto_rev(), PROTO_REV_3_0);
    assert_eq!(conn.state(), ConnectionState::Synchronized);
    assert_eq!(
        storage.get_entry_value("from_client").and_then(|v| v.as_double()),
        Some(2.0)
    );
    // the client's entry got the next server id and was broadcast
    let last = queue.take_messages().pop().unwrap();
    assert!(matches!(&*last, Message::EntryAssign { name, id, .. } if name == "from_client" && *id == 1));
}

#[tokio::test]
async fn test_server_handshake_rejects_newer_revision() {
    let (storage, _queue) = storage_with_queue(true);
    let handshake = ServerHandshake::new("srv".into(), storage);
    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![hello(0x0400, "future")]);

    assert!(!handshake.handshake(&conn.handle(), &mut channel).await);
    assert_eq!(
        channel.sent,
        vec![Arc::new(Message::ProtoUnsup {
            proto_rev: PROTO_REV_3_0
        })]
    );
}

#[tokio::test]
async fn test_server_handshake_legacy_client_is_synchronized_immediately() {
    let (storage, _queue) = storage_with_queue(true);
    storage.set_entry_value("x", Value::Double(1.0)).unwrap();
    let handshake = ServerHandshake::new("srv".into(), storage);
    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![hello(PROTO_REV_2_0, ""), x_assign()]);

    assert!(handshake.handshake(&conn.handle(), &mut channel).await);
    assert_eq!(channel.sent, vec![x_assign(), Arc::new(Message::ServerHelloDone)]);
    assert_eq!(conn.proto_rev(), PROTO_REV_2_0);
    assert_eq!(conn.state(), ConnectionState::Synchronized);
    // later traffic is left for the normal read path
    assert_eq!(channel.remaining(), 1);
}

#[tokio::test]
async fn test_server_handshake_fails_without_hello() {
    let (storage, _queue) = storage_with_queue(true);
    let handshake = ServerHandshake::new("srv".into(), storage);
    let conn = FakeConnection::new(1);

    let mut channel = ScriptedChannel::new(vec![Arc::new(Message::KeepAlive)]);
    assert!(!handshake.handshake(&conn.handle(), &mut channel).await);
    assert!(channel.sent.is_empty());

    let mut empty = ScriptedChannel::default();
    assert!(!handshake.handshake(&conn.handle(), &mut empty).await);
}

#[tokio::test]
async fn test_server_handshake_fails_when_client_leaves_midway() {
    let (storage, _queue) = storage_with_queue(true);
    let handshake = ServerHandshake::new("srv".into(), storage);
    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![hello(PROTO_REV_3_0, "c")]);

    assert!(!handshake.handshake(&conn.handle(), &mut channel).await);
}

#[tokio::test]
async fn test_client_handshake_applies_snapshot_and_resends_local_entries() {
    let (storage, _queue) = storage_with_queue(false);
    storage.set_entry_value("mine", Value::Boolean(true)).unwrap();
    let (hook, reconnects) = recorder();
    let handshake = ClientHandshake::new("me".into(), storage.clone(), hook);

    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![
        server_hello("srv"),
        x_assign(),
        Arc::new(Message::ServerHelloDone),
    ]);

    assert!(handshake.handshake(&conn.handle(), &mut channel).await);
    assert_eq!(storage.get_entry_value("x").and_then(|v| v.as_double()), Some(1.0));
    assert_eq!(conn.remote_id(), "srv");
    assert_eq!(conn.state(), ConnectionState::Synchronized);
    assert!(reconnects.lock().is_empty());

    assert_eq!(channel.sent.len(), 3);
    assert_eq!(channel.sent[0], hello(PROTO_REV_3_0, "me"));
    assert!(matches!(&*channel.sent[1], Message::EntryAssign { name, id, .. } if name == "mine" && *id == UNASSIGNED_ID));
    assert_eq!(channel.sent[2], Arc::new(Message::ClientHelloDone));
}

#[tokio::test]
async fn test_client_handshake_downgrades_on_proto_unsup() {
    let (storage, _queue) = storage_with_queue(false);
    let (hook, reconnects) = recorder();
    let handshake = ClientHandshake::new("me".into(), storage, hook);
    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![Arc::new(Message::ProtoUnsup {
        proto_rev: PROTO_REV_2_0,
    })]);

    assert!(!handshake.handshake(&conn.handle(), &mut channel).await);
    assert_eq!(*reconnects.lock(), vec![PROTO_REV_2_0]);
}

#[tokio::test]
async fn test_client_handshake_rejects_unexpected_message() {
    let (storage, _queue) = storage_with_queue(false);
    let (hook, _reconnects) = recorder();
    let handshake = ClientHandshake::new("me".into(), storage, hook);
    let conn = FakeConnection::new(1);
    let mut channel = ScriptedChannel::new(vec![
        server_hello("srv"),
        Message::entry_update(0, SequenceNumber::new(2), Arc::new(Value::Double(1.0))),
    ]);

    assert!(!handshake.handshake(&conn.handle(), &mut channel).await);
    assert_eq!(channel.sent.len(), 1);
}

#[tokio::test]
async fn test_client_handshake_legacy_server() {
    let (storage, _queue) = storage_with_queue(false);
    let (hook, _reconnects) = recorder();
    let handshake = ClientHandshake::new("me".into(), storage.clone(), hook);
    let conn = FakeConnection::with_rev(1, PROTO_REV_2_0);
    let mut channel = ScriptedChannel::new(vec![x_assign(), Arc::new(Message::ServerHelloDone)]);

    assert!(handshake.handshake(&conn.handle(), &mut channel).await);
    // no identity and no ClientHelloDone in 2.0
    assert_eq!(channel.sent, vec![hello(PROTO_REV_2_0, "me")]);
    assert_eq!(storage.get_entry_value("x").and_then(|v| v.as_double()), Some(1.0));
}
