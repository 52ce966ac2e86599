use std::ops::Deref;

use super::HubPolicy;
use super::ListenerHandle;
use super::NotificationHub;
use crate::network::ConnectionInfo;

/// Delivered connect/disconnect event.
#[derive(Debug, Clone)]
pub struct ConnectionNotification {
    pub listener: Option<ListenerHandle>,
    pub connected: bool,
    pub conn: ConnectionInfo,
}

#[derive(Debug, Default)]
pub struct ConnectionPolicy;

impl HubPolicy for ConnectionPolicy {
    type Filter = ();
    type Event = ConnectionNotification;

    fn matches(
        &self,
        _filter: &(),
        _event: &ConnectionNotification,
    ) -> bool {
        true
    }

    fn stamp(
        &self,
        event: &mut ConnectionNotification,
        listener: ListenerHandle,
    ) {
        event.listener = Some(listener);
    }
}

#[derive(Debug)]
pub struct ConnectionNotifier {
    hub: NotificationHub<ConnectionPolicy>,
}

impl ConnectionNotifier {
    pub fn new(poller_queue_size: usize) -> Self {
        Self {
            hub: NotificationHub::new("connection", ConnectionPolicy, poller_queue_size),
        }
    }

    pub fn notify_connection(
        &self,
        connected: bool,
        conn: ConnectionInfo,
        only: Option<ListenerHandle>,
    ) {
        self.hub.send(
            only,
            ConnectionNotification {
                listener: None,
                connected,
                conn,
            },
        );
    }
}

impl Deref for ConnectionNotifier {
    type Target = NotificationHub<ConnectionPolicy>;

    fn deref(&self) -> &Self::Target {
        &self.hub
    }
}
