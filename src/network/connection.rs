use std::net::SocketAddr;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ConnectionHandle;
use super::ConnectionId;
use super::ConnectionInfo;
use super::ConnectionState;
use super::Handshake;
use super::IncomingHandler;
use super::MessageChannel;
use super::PendingOutgoing;
use crate::constants::PROTO_REV_3_0;
use crate::metrics::ACTIVE_CONNECTIONS;
use crate::metrics::MESSAGES_RECEIVED;
use crate::metrics::MESSAGES_SENT;
use crate::notifier::ConnectionNotifier;
use crate::proto::EntryTypeLookup;
use crate::proto::Message;
use crate::proto::MessageCodec;
use crate::utils::time::get_now_as_micros;

type Batch = Vec<Arc<Message>>;

struct Pending {
    queue: PendingOutgoing,
    last_post: Instant,
}

/// Parts consumed by [`NetworkConnection::start`].
struct Startup {
    stream: TcpStream,
    outgoing_rx: mpsc::UnboundedReceiver<Batch>,
}

/// One peer over one TCP stream.
pub struct NetworkConnection {
    uid: ConnectionId,
    peer: Option<SocketAddr>,
    proto_rev: Arc<AtomicU16>,
    state: Mutex<ConnectionState>,
    remote_id: Mutex<String>,
    last_update: AtomicU64,

    pending: Mutex<Pending>,
    outgoing_tx: mpsc::UnboundedSender<Batch>,
    startup: Mutex<Option<Startup>>,
    keep_alive_interval: Duration,
    type_lookup: Option<EntryTypeLookup>,

    notifier: Arc<ConnectionNotifier>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkConnection {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NetworkConnection")
            .field("uid", &self.uid)
            .field("peer", &self.peer)
            .field("state", &*self.state.lock())
            .field("proto_rev", &self.proto_rev.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NetworkConnection {
    pub fn new(
        uid: ConnectionId,
        stream: TcpStream,
        notifier: Arc<ConnectionNotifier>,
        type_lookup: Option<EntryTypeLookup>,
        keep_alive_interval: Duration,
    ) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            uid,
            peer,
            proto_rev: Arc::new(AtomicU16::new(PROTO_REV_3_0)),
            state: Mutex::new(ConnectionState::Created),
            remote_id: Mutex::new(String::new()),
            last_update: AtomicU64::new(0),
            pending: Mutex::new(Pending {
                queue: PendingOutgoing::default(),
                last_post: Instant::now(),
            }),
            outgoing_tx,
            startup: Mutex::new(Some(Startup {
                stream,
                outgoing_rx,
            })),
            keep_alive_interval,
            type_lookup,
            notifier,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_dead(&self) -> bool {
        *self.state.lock() == ConnectionState::Dead
    }

    /// Spawn the read and write tasks. The read task runs `handshake`
    /// first and only then feeds messages to `incoming`. Calling twice is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start(
        self: &Arc<Self>,
        handshake: Arc<dyn Handshake>,
        incoming: IncomingHandler,
    ) {
        let Some(startup) = self.startup.lock().take() else {
            return;
        };
        self.set_state(ConnectionState::Init);

        let (read_half, write_half) = startup.stream.into_split();
        let codec = MessageCodec::new(self.proto_rev.clone(), self.type_lookup.clone());
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let write_task = tokio::spawn(write_loop(self.clone(), writer, startup.outgoing_rx));
        let read_task = tokio::spawn(read_loop(self.clone(), reader, handshake, incoming));

        let mut tasks = self.tasks.lock();
        tasks.push(read_task);
        tasks.push(write_task);
    }

    /// Ask both tasks to exit. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for both tasks to exit.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(uid = self.uid, error = %e, "connection task failed");
            }
        }
    }

    /// Hand the pending batch to the write task.
    ///
    /// With an empty batch and `keep_alive` set, a keep-alive goes out if
    /// nothing was posted within the keep-alive interval.
    pub fn post_outgoing(
        &self,
        keep_alive: bool,
    ) {
        let mut pending = self.pending.lock();
        let now = Instant::now();
        let batch = if pending.queue.is_empty() {
            if !keep_alive || now.duration_since(pending.last_post) < self.keep_alive_interval {
                return;
            }
            vec![Arc::new(Message::KeepAlive)]
        } else {
            pending.queue.take()
        };
        pending.last_post = now;
        drop(pending);

        trace!(uid = self.uid, count = batch.len(), "posting outgoing batch");
        if let Err(e) = self.outgoing_tx.send(batch) {
            debug!(uid = self.uid, count = e.0.len(), "write task gone, dropping outgoing batch");
        }
    }

    fn touch(&self) {
        self.last_update.store(get_now_as_micros(), Ordering::Relaxed);
    }
}

impl ConnectionHandle for NetworkConnection {
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
        if *current == ConnectionState::Dead {
            return;
        }
        let was = *current;
        *current = state;
        drop(current);

        if was != ConnectionState::Active && state == ConnectionState::Active {
            ACTIVE_CONNECTIONS.inc();
            self.notifier.notify_connection(true, self.info(), None);
        }
        if state == ConnectionState::Dead {
            if was == ConnectionState::Active {
                ACTIVE_CONNECTIONS.dec();
            }
            self.notifier.notify_connection(false, self.info(), None);
        }
        debug!(uid = self.uid, from = %was, to = %state, "connection state change");
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
            remote_ip: self.peer.map(|p| p.ip().to_string()).unwrap_or_default(),
            remote_port: self.peer.map(|p| p.port()).unwrap_or_default(),
            last_update: self.last_update.load(Ordering::Relaxed),
            protocol_version: self.proto_rev(),
        }
    }

    fn queue_outgoing(
        &self,
        msg: Arc<Message>,
    ) {
        self.pending.lock().queue.push(msg);
    }
}

/// Stream access handed to the handshake.
struct FramedChannel<'a> {
    conn: &'a NetworkConnection,
    reader: &'a mut FramedRead<OwnedReadHalf, MessageCodec>,
}

#[async_trait]
impl MessageChannel for FramedChannel<'_> {
    async fn next_message(&mut self) -> Option<Arc<Message>> {
        tokio::select! {
            _ = self.conn.shutdown.cancelled() => None,
            frame = self.reader.next() => match frame {
                Some(Ok(msg)) => {
                    self.conn.touch();
                    MESSAGES_RECEIVED.with_label_values(&[msg.message_type().as_str()]).inc();
                    Some(msg)
                }
                Some(Err(e)) => {
                    debug!(uid = self.conn.uid, error = %e, "read error during handshake");
                    None
                }
                None => None,
            },
        }
    }

    fn send(
        &mut self,
        msgs: Vec<Arc<Message>>,
    ) {
        if let Err(e) = self.conn.outgoing_tx.send(msgs) {
            debug!(uid = self.conn.uid, count = e.0.len(), "write task gone, dropping handshake messages");
        }
    }
}

async fn read_loop(
    conn: Arc<NetworkConnection>,
    mut reader: FramedRead<OwnedReadHalf, MessageCodec>,
    handshake: Arc<dyn Handshake>,
    incoming: IncomingHandler,
) {
    conn.set_state(ConnectionState::Handshake);
    let handle: Arc<dyn ConnectionHandle> = conn.clone();

    let ok = {
        let mut channel = FramedChannel {
            conn: &conn,
            reader: &mut reader,
        };
        handshake.handshake(&handle, &mut channel).await
    };
    if !ok {
        debug!(uid = conn.uid, peer = ?conn.peer, "handshake failed");
        conn.set_state(ConnectionState::Dead);
        conn.shutdown.cancel();
        return;
    }

    conn.set_state(ConnectionState::Active);
    info!(
        uid = conn.uid,
        peer = ?conn.peer,
        remote_id = %conn.remote_id(),
        proto_rev = conn.proto_rev(),
        "connection established"
    );

    loop {
        tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(msg)) => {
                    conn.touch();
                    MESSAGES_RECEIVED.with_label_values(&[msg.message_type().as_str()]).inc();
                    trace!(uid = conn.uid, msg_type = msg.message_type().as_str(), "received");
                    incoming(msg, &handle);
                }
                Some(Err(e)) => {
                    debug!(uid = conn.uid, error = %e, "dropping connection on read error");
                    break;
                }
                None => {
                    debug!(uid = conn.uid, "peer closed connection");
                    break;
                }
            },
        }
    }

    info!(uid = conn.uid, peer = ?conn.peer, "connection closed");
    conn.set_state(ConnectionState::Dead);
    conn.shutdown.cancel();
}

async fn write_loop(
    conn: Arc<NetworkConnection>,
    mut writer: FramedWrite<OwnedWriteHalf, MessageCodec>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Batch>,
) {
    loop {
        let batch = tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            batch = outgoing_rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let mut failed = false;
        for msg in batch {
            let kind = msg.message_type().as_str();
            if let Err(e) = writer.feed(msg).await {
                debug!(uid = conn.uid, error = %e, "write error");
                failed = true;
                break;
            }
            MESSAGES_SENT.with_label_values(&[kind]).inc();
        }
        if !failed {
            if let Err(e) = writer.flush().await {
                debug!(uid = conn.uid, error = %e, "flush error");
                failed = true;
            }
        }
        if failed {
            break;
        }
    }

    conn.set_state(ConnectionState::Dead);
    conn.shutdown.cancel();
}
