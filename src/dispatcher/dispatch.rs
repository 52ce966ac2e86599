use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ClientHandshake;
use super::ReconnectHook;
use super::ServerHandshake;
use super::StorageHandle;
use crate::constants::MAX_UPDATE_RATE_MS;
use crate::constants::MIN_UPDATE_RATE_MS;
use crate::constants::NET_MODE_CLIENT;
use crate::constants::NET_MODE_FAILURE;
use crate::constants::NET_MODE_NONE;
use crate::constants::NET_MODE_SERVER;
use crate::constants::NET_MODE_STARTING;
use crate::constants::PROTO_REV_3_0;
use crate::errors::NetworkError;
use crate::network::ConnectionHandle;
use crate::network::ConnectionId;
use crate::network::ConnectionInfo;
use crate::network::ConnectionState;
use crate::network::Connector;
use crate::network::Handshake;
use crate::network::IncomingHandler;
use crate::network::NetworkConnection;
use crate::network::ParallelConnector;
use crate::network::TcpConnector;
use crate::notifier::Callback;
use crate::notifier::ConnectionNotification;
use crate::notifier::ConnectionNotifier;
use crate::notifier::ListenerHandle;
use crate::notifier::PollerHandle;
use crate::proto::EntryTypeLookup;
use crate::proto::Message;
use crate::storage::OutgoingQueue;
use crate::NtConfig;
use crate::Result;

/// Timing knobs copied out of the configuration at construction.
#[derive(Debug, Clone)]
struct Timing {
    reconnect_backoff: Duration,
    connect_timeout: Duration,
    keep_alive_interval: Duration,
    min_flush_interval: Duration,
    save_interval: Duration,
    tcp_nodelay: bool,
}

struct DispatcherState {
    connections: Vec<Arc<NetworkConnection>>,
    identity: String,
    connector: Option<Arc<dyn Connector>>,
    connector_override: Option<Arc<dyn Connector>>,
    persist_file: Option<PathBuf>,
    /// Revision the next client connection starts with
    reconnect_proto_rev: u16,
    do_reconnect: bool,
    last_flush: Option<Instant>,
    local_addr: Option<SocketAddr>,
}

struct Shared {
    storage: Arc<dyn StorageHandle>,
    notifier: Arc<ConnectionNotifier>,
    state: Mutex<DispatcherState>,
    timing: Timing,

    active: AtomicBool,
    network_mode: AtomicU32,
    update_rate_ms: AtomicU64,
    next_uid: AtomicU32,

    flush: Notify,
    reconnect: Notify,
    shutdown: CancellationToken,
}

/// Owns the connections of one server or client session.
///
/// A dispatcher runs once: after [`Dispatcher::stop`] a new one must be
/// created to serve or connect again.
pub struct Dispatcher {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field("network_mode", &self.network_mode())
            .field("connections", &self.shared.state.lock().connections.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn StorageHandle>,
        notifier: Arc<ConnectionNotifier>,
        config: &NtConfig,
    ) -> Self {
        let network = &config.network;
        let update_rate_ms = network.update_rate_ms.clamp(MIN_UPDATE_RATE_MS, MAX_UPDATE_RATE_MS);
        Self {
            shared: Arc::new(Shared {
                storage,
                notifier,
                state: Mutex::new(DispatcherState {
                    connections: Vec::new(),
                    identity: config.identity.clone(),
                    connector: None,
                    connector_override: None,
                    persist_file: None,
                    reconnect_proto_rev: PROTO_REV_3_0,
                    do_reconnect: false,
                    last_flush: None,
                    local_addr: None,
                }),
                timing: Timing {
                    reconnect_backoff: network.reconnect_backoff(),
                    connect_timeout: network.connect_timeout(),
                    keep_alive_interval: network.keep_alive_interval(),
                    min_flush_interval: network.min_flush_interval(),
                    save_interval: config.persistence.save_interval(),
                    tcp_nodelay: network.tcp_nodelay,
                },
                active: AtomicBool::new(false),
                network_mode: AtomicU32::new(NET_MODE_NONE),
                update_rate_ms: AtomicU64::new(update_rate_ms),
                next_uid: AtomicU32::new(0),
                flush: Notify::new(),
                reconnect: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // -
    // Lifecycle

    /// Load `persist_file` (if any), bind `listen` and start accepting.
    pub async fn start_server(
        &self,
        persist_file: Option<PathBuf>,
        listen: SocketAddr,
    ) -> Result<()> {
        self.activate()?;
        let shared = &self.shared;
        shared
            .network_mode
            .store(NET_MODE_SERVER | NET_MODE_STARTING, Ordering::Release);

        if let Some(path) = &persist_file {
            let mut first = true;
            let loaded = shared.storage.load_persistent(path, &mut |line, msg| {
                if first {
                    first = false;
                    warn!(path = %path.display(), "when reading initial persistent values:");
                }
                warn!("{}:{}: {}", path.display(), line, msg);
            });
            if let Err(e) = loaded {
                warn!(path = %path.display(), error = %e, "could not load persistent file");
            }
        }
        shared.state.lock().persist_file = persist_file;

        let queue: Arc<dyn OutgoingQueue> = shared.clone();
        shared.storage.set_dispatcher(Arc::downgrade(&queue), true);

        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(source) => {
                shared.active.store(false, Ordering::Release);
                shared
                    .network_mode
                    .store(NET_MODE_SERVER | NET_MODE_FAILURE, Ordering::Release);
                return Err(NetworkError::Bind {
                    address: listen.to_string(),
                    source,
                }
                .into());
            }
        };
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        shared.state.lock().local_addr = Some(local_addr);
        shared.network_mode.store(NET_MODE_SERVER, Ordering::Release);
        info!(%local_addr, "server listening");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(dispatch_loop(shared.clone())));
        tasks.push(tokio::spawn(accept_loop(shared.clone(), listener)));
        Ok(())
    }

    /// Start the connect loop. Servers are set with [`Dispatcher::set_server`]
    /// and friends, before or after starting.
    pub fn start_client(&self) -> Result<()> {
        self.activate()?;
        let shared = &self.shared;
        shared
            .network_mode
            .store(NET_MODE_CLIENT | NET_MODE_STARTING, Ordering::Release);

        let queue: Arc<dyn OutgoingQueue> = shared.clone();
        shared.storage.set_dispatcher(Arc::downgrade(&queue), false);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(dispatch_loop(shared.clone())));
        tasks.push(tokio::spawn(client_loop(shared.clone())));
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() || self.shared.active.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyStarted.into());
        }
        Ok(())
    }

    /// Stop every task, then close every connection. Idempotent.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.active.store(false, Ordering::Release);
        shared.shutdown.cancel();
        shared.flush.notify_one();
        shared.reconnect.notify_one();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "dispatcher task failed");
            }
        }

        let conns: Vec<Arc<NetworkConnection>> = std::mem::take(&mut shared.state.lock().connections);
        for conn in &conns {
            conn.stop();
        }
        for conn in &conns {
            conn.join().await;
        }

        shared.storage.clear_dispatcher();
        shared.network_mode.store(NET_MODE_NONE, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// NET_MODE_* bits.
    pub fn network_mode(&self) -> u32 {
        self.shared.network_mode.load(Ordering::Acquire)
    }

    /// Address the server listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_addr
    }

    // -
    // Settings

    /// Dispatch period, clamped to 10 ms..=1 s.
    pub fn set_update_rate(
        &self,
        interval: Duration,
    ) {
        let ms = (interval.as_millis() as u64).clamp(MIN_UPDATE_RATE_MS, MAX_UPDATE_RATE_MS);
        self.shared.update_rate_ms.store(ms, Ordering::Release);
    }

    pub fn update_rate(&self) -> Duration {
        Duration::from_millis(self.shared.update_rate_ms.load(Ordering::Acquire))
    }

    /// Identity used by handshakes started from now on.
    pub fn set_identity(
        &self,
        identity: impl Into<String>,
    ) {
        self.shared.state.lock().identity = identity.into();
    }

    /// Wake the dispatch loop now. Ignored if the previous flush was less
    /// than the minimum flush interval ago.
    pub fn flush(&self) {
        let now = Instant::now();
        {
            let mut state = self.shared.state.lock();
            if let Some(last) = state.last_flush {
                if now.duration_since(last) < self.shared.timing.min_flush_interval {
                    return;
                }
            }
            state.last_flush = Some(now);
        }
        self.shared.flush.notify_one();
    }

    pub fn set_connector(
        &self,
        connector: Arc<dyn Connector>,
    ) {
        self.shared.state.lock().connector = Some(connector);
    }

    pub fn set_server(
        &self,
        host: &str,
        port: u16,
    ) {
        let connector = TcpConnector::new(host.trim(), port, self.shared.timing.connect_timeout);
        self.set_connector(Arc::new(connector));
    }

    /// Candidates tried in parallel on every attempt.
    pub fn set_server_list(
        &self,
        servers: Vec<(String, u16)>,
    ) {
        let servers = servers
            .into_iter()
            .map(|(host, port)| (host.trim().to_string(), port))
            .collect();
        let connector = ParallelConnector::new(servers, self.shared.timing.connect_timeout);
        self.set_connector(Arc::new(connector));
    }

    pub fn set_server_team(
        &self,
        team: u32,
        port: u16,
    ) {
        let connector = ParallelConnector::for_team(team, port, self.shared.timing.connect_timeout);
        self.set_connector(Arc::new(connector));
    }

    /// Use this server instead of the configured ones until cleared.
    pub fn set_server_override(
        &self,
        host: &str,
        port: u16,
    ) {
        let connector = TcpConnector::new(host.trim(), port, self.shared.timing.connect_timeout);
        self.shared.state.lock().connector_override = Some(Arc::new(connector));
    }

    pub fn clear_server_override(&self) {
        self.shared.state.lock().connector_override = None;
    }

    // -
    // Connections

    /// Snapshot of the active connections.
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        if !self.is_active() {
            return Vec::new();
        }
        self.shared
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Active)
            .map(|c| c.info())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.shared
            .state
            .lock()
            .connections
            .iter()
            .any(|c| c.state() == ConnectionState::Active)
    }

    /// Register a connection listener. With `immediate_notify` it is first
    /// told about every active connection.
    pub fn add_listener(
        &self,
        callback: Callback<ConnectionNotification>,
        immediate_notify: bool,
    ) -> ListenerHandle {
        let state = self.shared.state.lock();
        let uid = self.shared.notifier.add_listener((), callback);
        if immediate_notify {
            self.notify_active(&state, uid);
        }
        uid
    }

    pub fn add_polled_listener(
        &self,
        poller: PollerHandle,
        immediate_notify: bool,
    ) -> Option<ListenerHandle> {
        let state = self.shared.state.lock();
        let uid = self.shared.notifier.add_polled_listener(poller, ())?;
        if immediate_notify {
            self.notify_active(&state, uid);
        }
        Some(uid)
    }

    fn notify_active(
        &self,
        state: &DispatcherState,
        uid: ListenerHandle,
    ) {
        for conn in &state.connections {
            if conn.state() == ConnectionState::Active {
                self.shared.notifier.notify_connection(true, conn.info(), Some(uid));
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        for conn in self.shared.state.lock().connections.iter() {
            conn.stop();
        }
    }
}

impl OutgoingQueue for Shared {
    fn queue_outgoing(
        &self,
        msg: Arc<Message>,
        only: Option<ConnectionId>,
        except: Option<ConnectionId>,
    ) {
        let state = self.state.lock();
        for conn in &state.connections {
            let uid = conn.uid();
            if except == Some(uid) || only.is_some_and(|o| o != uid) {
                continue;
            }
            if matches!(conn.state(), ConnectionState::Synchronized | ConnectionState::Active) {
                conn.queue_outgoing(msg.clone());
            }
        }
    }
}

impl Shared {
    fn is_client(&self) -> bool {
        self.network_mode.load(Ordering::Acquire) & NET_MODE_CLIENT != 0
    }

    fn set_mode(
        &self,
        mode: u32,
    ) {
        self.network_mode.store(mode, Ordering::Release);
    }

    /// Wake the connect loop; the next connection starts at `proto_rev`.
    /// No-op when serving.
    fn client_reconnect(
        &self,
        proto_rev: u16,
    ) {
        if self.network_mode.load(Ordering::Acquire) & NET_MODE_SERVER != 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.reconnect_proto_rev = proto_rev;
            state.do_reconnect = true;
        }
        self.reconnect.notify_one();
    }

    fn new_connection(
        self: &Arc<Self>,
        stream: TcpStream,
    ) -> Arc<NetworkConnection> {
        if let Err(e) = stream.set_nodelay(self.timing.tcp_nodelay) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed) + 1;
        let storage = self.storage.clone();
        let type_lookup: EntryTypeLookup = Arc::new(move |id| storage.get_message_entry_type(id));
        NetworkConnection::new(
            uid,
            stream,
            self.notifier.clone(),
            Some(type_lookup),
            self.timing.keep_alive_interval,
        )
    }

    fn incoming_handler(&self) -> IncomingHandler {
        let storage = self.storage.clone();
        Arc::new(move |msg, conn| storage.process_incoming(msg, conn))
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "server: client connection");

        let conn = shared.new_connection(stream);
        let mut state = shared.state.lock();
        let handshake: Arc<dyn Handshake> = Arc::new(ServerHandshake::new(state.identity.clone(), shared.storage.clone()));
        match state.connections.iter_mut().find(|c| c.is_dead()) {
            Some(slot) => *slot = conn.clone(),
            None => state.connections.push(conn.clone()),
        }
        conn.start(handshake, shared.incoming_handler());
    }
    // drop the listener before reporting the mode change
    drop(listener);
    shared.set_mode(NET_MODE_NONE);
}

async fn client_loop(shared: Arc<Shared>) {
    'connect: loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = sleep(shared.timing.reconnect_backoff) => {}
        }

        let connector = {
            let state = shared.state.lock();
            state.connector_override.clone().or_else(|| state.connector.clone())
        };
        let Some(connector) = connector else {
            shared.set_mode(NET_MODE_CLIENT | NET_MODE_FAILURE);
            continue;
        };

        debug!("client trying to connect");
        let stream = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            stream = connector.connect() => stream,
        };
        let Some(stream) = stream else {
            shared.set_mode(NET_MODE_CLIENT | NET_MODE_FAILURE);
            continue;
        };
        debug!(peer = ?stream.peer_addr().ok(), "client connected");
        shared.set_mode(NET_MODE_CLIENT);

        let conn = shared.new_connection(stream);
        let weak = Arc::downgrade(&shared);
        let reconnect: ReconnectHook = Arc::new(move |proto_rev| {
            if let Some(shared) = weak.upgrade() {
                shared.client_reconnect(proto_rev);
            }
        });
        let replaced = {
            let mut state = shared.state.lock();
            let handshake: Arc<dyn Handshake> =
                Arc::new(ClientHandshake::new(state.identity.clone(), shared.storage.clone(), reconnect));
            let replaced = std::mem::replace(&mut state.connections, vec![conn.clone()]);
            conn.set_proto_rev(state.reconnect_proto_rev);
            state.reconnect_proto_rev = PROTO_REV_3_0;
            state.do_reconnect = false;
            conn.start(handshake, shared.incoming_handler());
            replaced
        };
        for old in replaced {
            old.stop();
        }

        loop {
            if shared.state.lock().do_reconnect {
                break;
            }
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break 'connect,
                _ = shared.reconnect.notified() => {}
            }
        }
        debug!("client reconnecting");
    }
    shared.set_mode(NET_MODE_NONE);
}

async fn dispatch_loop(shared: Arc<Shared>) {
    let mut deadline = tokio::time::Instant::now();
    let mut next_save = Instant::now() + shared.timing.save_interval;
    let mut count = 0u32;

    loop {
        let start = tokio::time::Instant::now();
        if start > deadline {
            deadline = start;
        }
        deadline += Duration::from_millis(shared.update_rate_ms.load(Ordering::Acquire));

        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = shared.flush.notified() => {}
            _ = sleep_until(deadline) => {}
        }
        if shared.shutdown.is_cancelled() {
            break;
        }

        let now = Instant::now();
        let persist_file = shared.state.lock().persist_file.clone();
        if let Some(path) = persist_file {
            if shared.network_mode.load(Ordering::Acquire) & NET_MODE_SERVER != 0 && now > next_save {
                next_save += shared.timing.save_interval;
                if now > next_save {
                    next_save = now + shared.timing.save_interval;
                }
                let storage = shared.storage.clone();
                match tokio::task::spawn_blocking(move || storage.save_persistent(&path, true)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "periodic persistent save"),
                    Err(e) => error!(error = %e, "periodic persistent save task failed"),
                }
            }
        }

        let is_client = shared.is_client();
        let mut state = shared.state.lock();
        count += 1;
        if count > 10 {
            debug!(connections = state.connections.len(), "dispatch running");
            count = 0;
        }

        let mut reconnect = false;
        for conn in &state.connections {
            match conn.state() {
                ConnectionState::Active => conn.post_outgoing(is_client),
                ConnectionState::Dead if is_client => reconnect = true,
                _ => {}
            }
        }
        if reconnect && !state.do_reconnect {
            state.do_reconnect = true;
            drop(state);
            shared.reconnect.notify_one();
        }
    }
}
