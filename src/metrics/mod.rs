use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

lazy_static! {
    pub static ref MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("nt_messages_received", "Messages decoded from peers"),
        &["msg_type"]
    )
    .expect("metric can not be created");

    pub static ref MESSAGES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("nt_messages_sent", "Messages written to peers"),
        &["msg_type"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_CONNECTIONS: IntGauge =
        IntGauge::new("nt_active_connections", "Connections in the active state")
            .expect("metric can not be created");

    pub static ref PERSIST_SAVE_FAILURES: IntCounter =
        IntCounter::new("nt_persist_save_failures", "Failed persistent file saves")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

/// Register every collector with `registry`. Duplicate registration is
/// reported and ignored.
pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(MESSAGES_SENT.clone()),
        Box::new(ACTIVE_CONNECTIONS.clone()),
        Box::new(PERSIST_SAVE_FAILURES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!("collector can not be registered: {}", e);
        }
    }
}

/// Text exposition of the crate registry.
pub fn gather_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
