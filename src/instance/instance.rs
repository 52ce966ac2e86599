use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;

use crate::constants::MAX_UPDATE_RATE_MS;
use crate::constants::MIN_UPDATE_RATE_MS;
use crate::constants::NET_MODE_NONE;
use crate::dispatcher::Dispatcher;
use crate::errors::EntryError;
use crate::errors::NetworkError;
use crate::network::ConnectionInfo;
use crate::notifier::ConnectionNotification;
use crate::notifier::ConnectionNotifier;
use crate::notifier::EntryNotification;
use crate::notifier::EntryNotifier;
use crate::notifier::EntrySelector;
use crate::notifier::ListenerHandle;
use crate::notifier::LogForwardLayer;
use crate::notifier::LogMessage;
use crate::notifier::LogNotifier;
use crate::notifier::PollerHandle;
use crate::notifier::Polled;
use crate::notifier::RpcAnswer;
use crate::notifier::RpcServer;
use crate::proto::Value;
use crate::proto::ValueType;
use crate::storage::EntryInfo;
use crate::storage::RpcOutcome;
use crate::storage::Storage;
use crate::NetworkMode;
use crate::NtConfig;
use crate::Result;

struct Settings {
    config: NtConfig,
    server_override: Option<(String, u16)>,
}

/// One NetworkTables node: the entry table plus its network session.
pub struct NtInstance {
    settings: Mutex<Settings>,
    entry_notifier: Arc<EntryNotifier>,
    connection_notifier: Arc<ConnectionNotifier>,
    rpc_server: Arc<RpcServer>,
    log_notifier: Arc<LogNotifier>,
    storage: Arc<Storage>,
    /// Current session; replaced on every start
    dispatcher: ArcSwapOption<Dispatcher>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for NtInstance {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NtInstance")
            .field("storage", &self.storage)
            .field("dispatcher", &self.dispatcher.load_full())
            .finish_non_exhaustive()
    }
}

/// `host` or `host:port`.
pub(crate) fn parse_server(
    address: &str,
    default_port: u16,
) -> (String, u16) {
    let address = address.trim();
    if let Some((host, port)) = address.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (host.to_string(), port);
        }
    }
    (address.to_string(), default_port)
}

impl NtInstance {
    pub fn new(config: NtConfig) -> Self {
        let queue_size = config.notifier.poller_queue_size;
        let entry_notifier = Arc::new(EntryNotifier::new(queue_size));
        let rpc_server = Arc::new(RpcServer::new(queue_size));
        let storage = Arc::new(Storage::new(entry_notifier.clone(), rpc_server.clone()));
        Self {
            settings: Mutex::new(Settings {
                config,
                server_override: None,
            }),
            entry_notifier,
            connection_notifier: Arc::new(ConnectionNotifier::new(queue_size)),
            rpc_server,
            log_notifier: Arc::new(LogNotifier::new(queue_size)),
            storage,
            dispatcher: ArcSwapOption::empty(),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> NtConfig {
        self.settings.lock().config.clone()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.load_full()
    }

    /// Install a fresh dispatcher, refusing while another one is running.
    fn new_dispatcher(&self) -> Result<Arc<Dispatcher>> {
        let config = self.settings.lock().config.clone();
        let _lifecycle = self.lifecycle.lock();
        if self.dispatcher().is_some_and(|d| d.is_active()) {
            return Err(NetworkError::AlreadyStarted.into());
        }
        let dispatcher = Arc::new(Dispatcher::new(
            self.storage.clone(),
            self.connection_notifier.clone(),
            &config,
        ));
        self.dispatcher.store(Some(dispatcher.clone()));
        Ok(dispatcher)
    }

    // -
    // Network lifecycle

    /// Start in the role the configuration names.
    pub async fn start(&self) -> Result<()> {
        let config = self.config();
        match config.network.mode {
            NetworkMode::Server => {
                let listen = SocketAddr::new(config.network.listen_address, config.network.port);
                self.start_server(config.persistence.file.clone(), listen).await
            }
            NetworkMode::Client => self.start_client(),
        }
    }

    /// Serve on `listen`, loading and periodically saving `persist_file`.
    pub async fn start_server(
        &self,
        persist_file: Option<PathBuf>,
        listen: SocketAddr,
    ) -> Result<()> {
        let dispatcher = self.new_dispatcher()?;
        info!(%listen, persist_file = ?persist_file, "starting server");
        dispatcher.start_server(persist_file, listen).await
    }

    /// Connect to the configured servers (or team), retrying until stopped.
    pub fn start_client(&self) -> Result<()> {
        let dispatcher = self.new_dispatcher()?;
        self.apply_servers(&dispatcher);
        info!("starting client");
        dispatcher.start_client()
    }

    fn apply_servers(
        &self,
        dispatcher: &Dispatcher,
    ) {
        let settings = self.settings.lock();
        let network = &settings.config.network;
        if let Some(team) = network.team {
            dispatcher.set_server_team(team, network.port);
        } else {
            let servers: Vec<(String, u16)> = network
                .server_addresses
                .iter()
                .map(|s| parse_server(s, network.port))
                .collect();
            match servers.as_slice() {
                [] => {}
                [(host, port)] => dispatcher.set_server(host, *port),
                _ => dispatcher.set_server_list(servers),
            }
        }
        match &settings.server_override {
            Some((host, port)) => dispatcher.set_server_override(host, *port),
            None => dispatcher.clear_server_override(),
        }
    }

    /// Stop the network session; entries stay in the table.
    pub async fn stop(&self) {
        let dispatcher = {
            let _lifecycle = self.lifecycle.lock();
            self.dispatcher.swap(None)
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop().await;
            info!("network stopped");
        }
    }

    /// NET_MODE_* bits of the current session.
    pub fn get_network_mode(&self) -> u32 {
        self.dispatcher()
            .map(|d| d.network_mode())
            .unwrap_or(NET_MODE_NONE)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.dispatcher().and_then(|d| d.local_addr())
    }

    pub fn set_identity(
        &self,
        identity: &str,
    ) {
        self.settings.lock().config.identity = identity.to_string();
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.set_identity(identity);
        }
    }

    pub fn set_update_rate(
        &self,
        interval: Duration,
    ) {
        let ms = (interval.as_millis() as u64).clamp(MIN_UPDATE_RATE_MS, MAX_UPDATE_RATE_MS);
        self.settings.lock().config.network.update_rate_ms = ms;
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.set_update_rate(interval);
        }
    }

    pub fn flush(&self) {
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.flush();
        }
    }

    pub fn set_server(
        &self,
        host: &str,
        port: u16,
    ) {
        self.set_server_list(vec![(host.to_string(), port)]);
    }

    pub fn set_server_list(
        &self,
        servers: Vec<(String, u16)>,
    ) {
        {
            let mut settings = self.settings.lock();
            let network = &mut settings.config.network;
            network.team = None;
            network.server_addresses = servers
                .into_iter()
                .map(|(host, port)| format!("{}:{}", host.trim(), port))
                .collect();
        }
        self.reapply_servers();
    }

    pub fn set_server_team(
        &self,
        team: u32,
        port: u16,
    ) {
        {
            let mut settings = self.settings.lock();
            settings.config.network.team = Some(team);
            settings.config.network.port = port;
        }
        self.reapply_servers();
    }

    /// Prefer this server over the configured ones until cleared.
    pub fn set_server_override(
        &self,
        host: &str,
        port: u16,
    ) {
        self.settings.lock().server_override = Some((host.trim().to_string(), port));
        self.reapply_servers();
    }

    pub fn clear_server_override(&self) {
        self.settings.lock().server_override = None;
        self.reapply_servers();
    }

    fn reapply_servers(&self) {
        if let Some(dispatcher) = self.dispatcher() {
            debug!("server selection changed");
            self.apply_servers(&dispatcher);
        }
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.dispatcher()
            .map(|d| d.get_connections())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher().is_some_and(|d| d.is_connected())
    }

    // -
    // Entries

    /// Local id for `name`, creating an empty entry if needed.
    pub fn get_entry(
        &self,
        name: &str,
    ) -> Option<usize> {
        self.storage.get_entry(name)
    }

    pub fn get_entries(
        &self,
        prefix: &str,
        types: u32,
    ) -> Vec<usize> {
        self.storage.get_entries(prefix, types)
    }

    pub fn get_entry_info(
        &self,
        local_id: usize,
    ) -> Option<EntryInfo> {
        self.storage.get_entry_info(local_id)
    }

    pub fn get_entry_infos(
        &self,
        prefix: &str,
        types: u32,
    ) -> Vec<EntryInfo> {
        self.storage.get_entry_infos(prefix, types)
    }

    pub fn get_entry_name(
        &self,
        local_id: usize,
    ) -> Option<String> {
        self.storage.get_entry_name(local_id)
    }

    pub fn get_entry_type(
        &self,
        local_id: usize,
    ) -> ValueType {
        self.storage.get_entry_type(local_id)
    }

    pub fn get_entry_last_change(
        &self,
        local_id: usize,
    ) -> u64 {
        self.storage.get_entry_last_change(local_id)
    }

    pub fn get_entry_value(
        &self,
        name: &str,
    ) -> Option<Arc<Value>> {
        self.storage.get_entry_value(name)
    }

    pub fn set_entry_value(
        &self,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.storage.set_entry_value(name, value)
    }

    pub fn set_default_entry_value(
        &self,
        name: &str,
        value: Value,
    ) -> bool {
        self.storage.set_default_entry_value(name, value)
    }

    pub fn set_entry_type_value(
        &self,
        name: &str,
        value: Value,
    ) {
        self.storage.set_entry_type_value(name, value)
    }

    pub fn set_entry_flags(
        &self,
        name: &str,
        flags: u8,
    ) {
        self.storage.set_entry_flags(name, flags)
    }

    pub fn get_entry_flags(
        &self,
        name: &str,
    ) -> u8 {
        self.storage.get_entry_flags(name)
    }

    pub fn delete_entry(
        &self,
        name: &str,
    ) {
        self.storage.delete_entry(name)
    }

    pub fn delete_all_entries(&self) {
        self.storage.delete_all_entries()
    }

    // -
    // Entry listeners

    pub fn add_entry_listener<F>(
        &self,
        prefix: &str,
        flags: u32,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(&EntryNotification) + Send + Sync + 'static,
    {
        self.storage
            .add_listener(EntrySelector::Prefix(prefix.to_string()), flags, Arc::new(callback))
    }

    pub fn add_entry_listener_by_id<F>(
        &self,
        local_id: usize,
        flags: u32,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(&EntryNotification) + Send + Sync + 'static,
    {
        self.storage
            .add_listener(EntrySelector::Entry(local_id), flags, Arc::new(callback))
    }

    pub fn create_entry_listener_poller(&self) -> PollerHandle {
        self.entry_notifier.create_poller()
    }

    pub fn add_polled_entry_listener(
        &self,
        poller: PollerHandle,
        prefix: &str,
        flags: u32,
    ) -> Option<ListenerHandle> {
        self.storage
            .add_polled_listener(poller, EntrySelector::Prefix(prefix.to_string()), flags)
    }

    pub fn add_polled_entry_listener_by_id(
        &self,
        poller: PollerHandle,
        local_id: usize,
        flags: u32,
    ) -> Option<ListenerHandle> {
        self.storage
            .add_polled_listener(poller, EntrySelector::Entry(local_id), flags)
    }

    pub fn poll_entry_listener(
        &self,
        poller: PollerHandle,
        timeout: Option<Duration>,
    ) -> Polled<EntryNotification> {
        self.entry_notifier.poll(poller, timeout)
    }

    pub fn cancel_poll_entry_listener(
        &self,
        poller: PollerHandle,
    ) {
        self.entry_notifier.cancel_poll(poller)
    }

    pub fn destroy_entry_listener_poller(
        &self,
        poller: PollerHandle,
    ) {
        self.entry_notifier.remove_poller(poller)
    }

    pub fn remove_entry_listener(
        &self,
        listener: ListenerHandle,
    ) -> bool {
        self.entry_notifier.remove_listener(listener)
    }

    pub fn wait_for_entry_listener_queue(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        self.entry_notifier.wait_for_queue(timeout)
    }

    // -
    // Connection listeners

    /// With `immediate_notify` the listener first hears about every peer
    /// already connected.
    pub fn add_connection_listener<F>(
        &self,
        callback: F,
        immediate_notify: bool,
    ) -> ListenerHandle
    where
        F: Fn(&ConnectionNotification) + Send + Sync + 'static,
    {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.add_listener(Arc::new(callback), immediate_notify),
            None => self.connection_notifier.add_listener((), Arc::new(callback)),
        }
    }

    pub fn create_connection_listener_poller(&self) -> PollerHandle {
        self.connection_notifier.create_poller()
    }

    pub fn add_polled_connection_listener(
        &self,
        poller: PollerHandle,
        immediate_notify: bool,
    ) -> Option<ListenerHandle> {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.add_polled_listener(poller, immediate_notify),
            None => self.connection_notifier.add_polled_listener(poller, ()),
        }
    }

    pub fn poll_connection_listener(
        &self,
        poller: PollerHandle,
        timeout: Option<Duration>,
    ) -> Polled<ConnectionNotification> {
        self.connection_notifier.poll(poller, timeout)
    }

    pub fn cancel_poll_connection_listener(
        &self,
        poller: PollerHandle,
    ) {
        self.connection_notifier.cancel_poll(poller)
    }

    pub fn destroy_connection_listener_poller(
        &self,
        poller: PollerHandle,
    ) {
        self.connection_notifier.remove_poller(poller)
    }

    pub fn remove_connection_listener(
        &self,
        listener: ListenerHandle,
    ) -> bool {
        self.connection_notifier.remove_listener(listener)
    }

    pub fn wait_for_connection_listener_queue(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        self.connection_notifier.wait_for_queue(timeout)
    }

    // -
    // RPC

    /// Serve entry `local_id` as an RPC answered by `callback`.
    pub fn create_rpc<F>(
        &self,
        local_id: usize,
        def: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&RpcAnswer) -> Vec<u8> + Send + Sync + 'static,
    {
        let rpc_uid = self.rpc_server.add_rpc(callback);
        if let Err(e) = self.storage.create_rpc(local_id, def, rpc_uid) {
            self.rpc_server.remove_listener(rpc_uid);
            return Err(e);
        }
        Ok(())
    }

    pub fn create_rpc_call_poller(&self) -> PollerHandle {
        self.rpc_server.create_poller()
    }

    /// Serve entry `local_id` as an RPC whose calls are delivered to
    /// `poller`; answer them with [`NtInstance::post_rpc_response`].
    pub fn create_polled_rpc(
        &self,
        local_id: usize,
        def: Vec<u8>,
        poller: PollerHandle,
    ) -> Result<()> {
        let Some(rpc_uid) = self.rpc_server.add_polled_rpc(poller) else {
            return Err(EntryError::UnknownPoller(poller.index()).into());
        };
        if let Err(e) = self.storage.create_rpc(local_id, def, rpc_uid) {
            self.rpc_server.remove_listener(rpc_uid);
            return Err(e);
        }
        Ok(())
    }

    pub fn poll_rpc(
        &self,
        poller: PollerHandle,
        timeout: Option<Duration>,
    ) -> Polled<RpcAnswer> {
        self.rpc_server.poll(poller, timeout)
    }

    pub fn cancel_poll_rpc(
        &self,
        poller: PollerHandle,
    ) {
        self.rpc_server.cancel_poll(poller)
    }

    pub fn destroy_rpc_call_poller(
        &self,
        poller: PollerHandle,
    ) {
        self.rpc_server.remove_poller(poller)
    }

    pub fn post_rpc_response(
        &self,
        local_id: usize,
        call_uid: u16,
        result: Vec<u8>,
    ) -> bool {
        self.rpc_server.post_rpc_response(local_id, call_uid, result)
    }

    pub fn call_rpc(
        &self,
        local_id: usize,
        params: Vec<u8>,
    ) -> Result<u16> {
        self.storage.call_rpc(local_id, params)
    }

    pub fn get_rpc_result(
        &self,
        local_id: usize,
        call_uid: u16,
        timeout: Option<Duration>,
    ) -> RpcOutcome {
        self.storage.get_rpc_result(local_id, call_uid, timeout)
    }

    pub fn cancel_rpc_result(
        &self,
        local_id: usize,
        call_uid: u16,
    ) {
        self.storage.cancel_rpc_result(local_id, call_uid)
    }

    // -
    // Persistence

    pub fn save_persistent(
        &self,
        path: &Path,
    ) -> Result<()> {
        self.storage.save_persistent(path, false)
    }

    /// Bad lines are reported to `warn` as (line number, message).
    pub fn load_persistent(
        &self,
        path: &Path,
        mut warn: impl FnMut(usize, &str),
    ) -> Result<()> {
        self.storage.load_persistent(path, &mut warn)
    }

    pub fn save_entries(
        &self,
        path: &Path,
        prefix: &str,
    ) -> Result<()> {
        self.storage.save_entries(path, prefix)
    }

    pub fn load_entries(
        &self,
        path: &Path,
        prefix: &str,
        mut warn: impl FnMut(usize, &str),
    ) -> Result<()> {
        self.storage.load_entries(path, prefix, &mut warn)
    }

    // -
    // Logging

    /// Layer to add to the process subscriber so this instance's loggers
    /// see `tracing` output.
    pub fn log_layer(&self) -> LogForwardLayer {
        LogForwardLayer::new(&self.log_notifier)
    }

    pub fn add_logger<F>(
        &self,
        min_level: u32,
        max_level: u32,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(&LogMessage) + Send + Sync + 'static,
    {
        self.log_notifier.add_logger(min_level, max_level, Arc::new(callback))
    }

    pub fn create_logger_poller(&self) -> PollerHandle {
        self.log_notifier.create_poller()
    }

    pub fn add_polled_logger(
        &self,
        poller: PollerHandle,
        min_level: u32,
        max_level: u32,
    ) -> Option<ListenerHandle> {
        self.log_notifier.add_polled_logger(poller, min_level, max_level)
    }

    pub fn poll_logger(
        &self,
        poller: PollerHandle,
        timeout: Option<Duration>,
    ) -> Polled<LogMessage> {
        self.log_notifier.poll(poller, timeout)
    }

    pub fn cancel_poll_logger(
        &self,
        poller: PollerHandle,
    ) {
        self.log_notifier.cancel_poll(poller)
    }

    pub fn destroy_logger_poller(
        &self,
        poller: PollerHandle,
    ) {
        self.log_notifier.remove_poller(poller)
    }

    pub fn remove_logger(
        &self,
        logger: ListenerHandle,
    ) -> bool {
        self.log_notifier.remove_listener(logger)
    }

    pub fn wait_for_logger_queue(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        self.log_notifier.wait_for_queue(timeout)
    }
}
