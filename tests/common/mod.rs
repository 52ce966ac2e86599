use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use ntables::NtConfig;
use ntables::NtInstance;
use tracing::debug;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    static ref LOGGER_INIT: () = {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    };
}

pub fn enable_logger() {
    *LOGGER_INIT;
}

/// Fast timings so tests converge in milliseconds.
pub fn test_config(identity: &str) -> NtConfig {
    let mut config = NtConfig::default();
    config.identity = identity.to_string();
    config.network.update_rate_ms = 10;
    config.network.reconnect_backoff_ms = 20;
    config.network.connect_timeout_ms = 500;
    config.network.keep_alive_interval_ms = 100;
    config.persistence.save_interval_ms = 50;
    config
}

pub fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A server on an ephemeral loopback port.
pub async fn start_server(identity: &str) -> (Arc<NtInstance>, u16) {
    let server = Arc::new(NtInstance::new(test_config(identity)));
    server.start_server(None, any_port()).await.unwrap();
    let port = server.local_addr().unwrap().port();
    debug!(identity, port, "test server up");
    (server, port)
}

/// A client pointed at `127.0.0.1:port`. Not yet started.
pub fn new_client(
    identity: &str,
    port: u16,
) -> Arc<NtInstance> {
    let client = Arc::new(NtInstance::new(test_config(identity)));
    client.set_server("127.0.0.1", port);
    client
}

pub async fn start_client(
    identity: &str,
    port: u16,
) -> Arc<NtInstance> {
    let client = new_client(identity, port);
    client.start_client().unwrap();
    assert!(wait_for(|| client.is_connected()).await, "{identity} never connected");
    client
}

/// Poll `check` until it holds or [`WAIT_TIMEOUT`] passes.
pub async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn double_of(
    instance: &NtInstance,
    name: &str,
) -> Option<f64> {
    instance.get_entry_value(name).and_then(|v| v.as_double())
}
