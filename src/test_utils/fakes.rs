use std::collections::VecDeque;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::constants::PROTO_REV_3_0;
use crate::network::ConnectionHandle;
use crate::network::ConnectionId;
use crate::network::ConnectionInfo;
use crate::network::ConnectionState;
use crate::network::MessageChannel;
use crate::notifier::EntryNotifier;
use crate::notifier::RpcServer;
use crate::proto::Message;
use crate::storage::OutgoingQueue;
use crate::storage::Storage;

/// One recorded `queue_outgoing` call.
#[derive(Debug, Clone)]
pub struct Sent {
    pub msg: Arc<Message>,
    pub only: Option<ConnectionId>,
    pub except: Option<ConnectionId>,
}

/// Dispatcher stand-in recording everything Storage queues.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn take_messages(&self) -> Vec<Arc<Message>> {
        self.take().into_iter().map(|s| s.msg).collect()
    }
}

impl OutgoingQueue for RecordingQueue {
    fn queue_outgoing(
        &self,
        msg: Arc<Message>,
        only: Option<ConnectionId>,
        except: Option<ConnectionId>,
    ) {
        self.sent.lock().push(Sent { msg, only, except });
    }
}

/// Connection stand-in with no socket behind it.
#[derive(Debug)]
pub struct FakeConnection {
    uid: ConnectionId,
    proto_rev: AtomicU16,
    state: Mutex<ConnectionState>,
    remote_id: Mutex<String>,
    queued: Mutex<Vec<Arc<Message>>>,
}

impl FakeConnection {
    pub fn new(uid: ConnectionId) -> Arc<Self> {
        Self::with_rev(uid, PROTO_REV_3_0)
    }

    pub fn with_rev(
        uid: ConnectionId,
        proto_rev: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            proto_rev: AtomicU16::new(proto_rev),
            state: Mutex::new(ConnectionState::Handshake),
            remote_id: Mutex::new(String::new()),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> Arc<dyn ConnectionHandle> {
        self.clone()
    }

    pub fn take_queued(&self) -> Vec<Arc<Message>> {
        std::mem::take(&mut *self.queued.lock())
    }
}

impl ConnectionHandle for FakeConnection {
    fn uid(&self) -> ConnectionId {
        self.uid
    }

    fn proto_rev(&self) -> u16 {
        self.proto_rev.load(Ordering::Acquire)
    }

    fn set_proto_rev(
        &self,
        proto_rev: u16,
    ) {
        self.proto_rev.store(proto_rev, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(
        &self,
        state: ConnectionState,
    ) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Dead {
            *current = state;
        }
    }

    fn remote_id(&self) -> String {
        self.remote_id.lock().clone()
    }

    fn set_remote_id(
        &self,
        remote_id: String,
    ) {
        *self.remote_id.lock() = remote_id;
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_id: self.remote_id(),
            remote_ip: "127.0.0.1".to_string(),
            remote_port: 0,
            last_update: 0,
            protocol_version: self.proto_rev(),
        }
    }

    fn queue_outgoing(
        &self,
        msg: Arc<Message>,
    ) {
        self.queued.lock().push(msg);
    }
}

/// Handshake channel replaying a fixed script of incoming messages.
/// Running out of script reads as a disconnect.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    incoming: VecDeque<Arc<Message>>,
    pub sent: Vec<Arc<Message>>,
}

impl ScriptedChannel {
    pub fn new(incoming: Vec<Arc<Message>>) -> Self {
        Self {
            incoming: incoming.into(),
            sent: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.incoming.len()
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    async fn next_message(&mut self) -> Option<Arc<Message>> {
        self.incoming.pop_front()
    }

    fn send(
        &mut self,
        msgs: Vec<Arc<Message>>,
    ) {
        self.sent.extend(msgs);
    }
}

/// Storage wired to a recording dispatcher in the given role.
pub fn storage_with_queue(server: bool) -> (Arc<Storage>, Arc<RecordingQueue>) {
    let storage = Arc::new(Storage::new(
        Arc::new(EntryNotifier::new(64)),
        Arc::new(RpcServer::new(64)),
    ));
    let queue = RecordingQueue::new();
    let dispatcher: Arc<dyn OutgoingQueue> = queue.clone();
    storage.set_dispatcher(Arc::downgrade(&dispatcher), server);
    (storage, queue)
}
