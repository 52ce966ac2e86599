//! Log message fan-out.
//!
//! [`LogForwardLayer`] is a `tracing_subscriber` layer that turns `tracing`
//! events into [`LogMessage`]s on a [`LogNotifier`], so applications can
//! observe the engine's diagnostics through the same listener/poller API as
//! entry changes.

use std::fmt::Write as _;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Weak;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Level;
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::Callback;
use super::HubPolicy;
use super::ListenerHandle;
use super::NotificationHub;
use super::PollerHandle;

pub const LOG_CRITICAL: u32 = 50;
pub const LOG_ERROR: u32 = 40;
pub const LOG_WARNING: u32 = 30;
pub const LOG_INFO: u32 = 20;
pub const LOG_DEBUG: u32 = 10;
pub const LOG_DEBUG4: u32 = 6;

pub fn level_number(level: &Level) -> u32 {
    match *level {
        Level::ERROR => LOG_ERROR,
        Level::WARN => LOG_WARNING,
        Level::INFO => LOG_INFO,
        Level::DEBUG => LOG_DEBUG,
        Level::TRACE => LOG_DEBUG4,
    }
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub listener: Option<ListenerHandle>,
    pub level: u32,
    pub filename: String,
    pub line: u32,
    pub message: String,
}

/// Inclusive level range a log listener wants.
#[derive(Debug, Clone, Copy)]
pub struct LevelRange {
    pub min_level: u32,
    pub max_level: u32,
}

#[derive(Debug, Default)]
pub struct LogPolicy;

impl HubPolicy for LogPolicy {
    type Filter = LevelRange;
    type Event = LogMessage;

    fn matches(
        &self,
        filter: &LevelRange,
        event: &LogMessage,
    ) -> bool {
        event.level >= filter.min_level && event.level <= filter.max_level
    }

    fn stamp(
        &self,
        event: &mut LogMessage,
        listener: ListenerHandle,
    ) {
        event.listener = Some(listener);
    }
}

#[derive(Debug)]
pub struct LogNotifier {
    hub: NotificationHub<LogPolicy>,
}

impl LogNotifier {
    pub fn new(poller_queue_size: usize) -> Self {
        Self {
            hub: NotificationHub::new("log", LogPolicy, poller_queue_size),
        }
    }

    pub fn add_logger(
        &self,
        min_level: u32,
        max_level: u32,
        callback: Callback<LogMessage>,
    ) -> ListenerHandle {
        self.hub.add_listener(
            LevelRange {
                min_level,
                max_level,
            },
            callback,
        )
    }

    pub fn add_polled_logger(
        &self,
        poller: PollerHandle,
        min_level: u32,
        max_level: u32,
    ) -> Option<ListenerHandle> {
        self.hub.add_polled_listener(
            poller,
            LevelRange {
                min_level,
                max_level,
            },
        )
    }

    pub fn log(
        &self,
        level: u32,
        filename: &str,
        line: u32,
        message: String,
    ) {
        self.hub.send(
            None,
            LogMessage {
                listener: None,
                level,
                filename: filename.to_string(),
                line,
                message,
            },
        );
    }
}

impl Deref for LogNotifier {
    type Target = NotificationHub<LogPolicy>;

    fn deref(&self) -> &Self::Target {
        &self.hub
    }
}

/// Forwards `tracing` events into a [`LogNotifier`].
///
/// Events emitted by the notifier module itself are skipped so delivery
/// never feeds back into the hub.
#[derive(Debug, Clone)]
pub struct LogForwardLayer {
    notifier: Weak<LogNotifier>,
}

impl LogForwardLayer {
    pub fn new(notifier: &Arc<LogNotifier>) -> Self {
        Self {
            notifier: Arc::downgrade(notifier),
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(
        &mut self,
        field: &Field,
        value: &str,
    ) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(
        &mut self,
        field: &Field,
        value: &dyn std::fmt::Debug,
    ) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(
        &self,
        event: &Event<'_>,
        _ctx: Context<'_, S>,
    ) {
        let metadata = event.metadata();
        if metadata.target().starts_with(module_path!().trim_end_matches("::log_notifier")) {
            return;
        }
        let Some(notifier) = self.notifier.upgrade() else {
            return;
        };
        if notifier.listener_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);

        notifier.log(
            level_number(metadata.level()),
            metadata.file().unwrap_or(""),
            metadata.line().unwrap_or(0),
            visitor.message,
        );
    }
}
