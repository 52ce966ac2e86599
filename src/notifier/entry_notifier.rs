use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use super::Callback;
use super::HubPolicy;
use super::ListenerHandle;
use super::NotificationHub;
use super::PollerHandle;
use crate::constants::NOTIFY_FLAGS;
use crate::constants::NOTIFY_IMMEDIATE;
use crate::constants::NOTIFY_LOCAL;
use crate::constants::NOTIFY_UPDATE;
use crate::proto::Value;

/// What an entry listener is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySelector {
    /// Every entry whose name starts with the prefix
    Prefix(String),
    /// Exactly one entry, by local id
    Entry(usize),
}

#[derive(Debug, Clone)]
pub struct EntryListenerFilter {
    pub selector: EntrySelector,
    pub flags: u32,
}

/// Delivered entry change.
#[derive(Debug, Clone)]
pub struct EntryNotification {
    /// Listener this copy was delivered to
    pub listener: Option<ListenerHandle>,
    pub local_id: usize,
    pub name: String,
    /// New value; the previous value for deletions
    pub value: Option<Arc<Value>>,
    /// NOTIFY_* bits describing the change
    pub flags: u32,
}

#[derive(Debug, Default)]
pub struct EntryPolicy;

impl HubPolicy for EntryPolicy {
    type Filter = EntryListenerFilter;
    type Event = EntryNotification;

    fn matches(
        &self,
        filter: &EntryListenerFilter,
        event: &EntryNotification,
    ) -> bool {
        if event.value.is_none() {
            return false;
        }

        if event.flags & NOTIFY_LOCAL != 0 && filter.flags & NOTIFY_LOCAL == 0 {
            return false;
        }

        // An incoming assign can change value and flags at once; such an
        // event goes to listeners interested in either.
        let mut listen_flags = filter.flags & !(NOTIFY_IMMEDIATE | NOTIFY_LOCAL);
        let mut flags = event.flags & !(NOTIFY_IMMEDIATE | NOTIFY_LOCAL);
        let assign_both = NOTIFY_UPDATE | NOTIFY_FLAGS;
        if flags & assign_both == assign_both {
            if listen_flags & assign_both == 0 {
                return false;
            }
            listen_flags &= !assign_both;
            flags &= !assign_both;
        }
        if flags & !listen_flags != 0 {
            return false;
        }

        match &filter.selector {
            EntrySelector::Entry(local_id) => *local_id == event.local_id,
            EntrySelector::Prefix(prefix) => event.name.starts_with(prefix.as_str()),
        }
    }

    fn stamp(
        &self,
        event: &mut EntryNotification,
        listener: ListenerHandle,
    ) {
        event.listener = Some(listener);
    }
}

/// Entry change notifier.
#[derive(Debug)]
pub struct EntryNotifier {
    hub: NotificationHub<EntryPolicy>,
    /// Whether any listener asked for locally originated changes
    local_notifiers: AtomicBool,
}

impl EntryNotifier {
    pub fn new(poller_queue_size: usize) -> Self {
        Self {
            hub: NotificationHub::new("entry", EntryPolicy, poller_queue_size),
            local_notifiers: AtomicBool::new(false),
        }
    }

    pub fn add(
        &self,
        selector: EntrySelector,
        flags: u32,
        callback: Callback<EntryNotification>,
    ) -> ListenerHandle {
        self.note_local(flags);
        self.hub
            .add_listener(EntryListenerFilter { selector, flags }, callback)
    }

    pub fn add_polled(
        &self,
        poller: PollerHandle,
        selector: EntrySelector,
        flags: u32,
    ) -> Option<ListenerHandle> {
        self.note_local(flags);
        self.hub
            .add_polled_listener(poller, EntryListenerFilter { selector, flags })
    }

    fn note_local(
        &self,
        flags: u32,
    ) {
        if flags & NOTIFY_LOCAL != 0 {
            self.local_notifiers.store(true, Ordering::Release);
        }
    }

    pub fn local_notifiers(&self) -> bool {
        self.local_notifiers.load(Ordering::Acquire)
    }

    /// Queue an entry change. `only` restricts delivery to one listener
    /// (used for immediate notifications on registration).
    pub fn notify_entry(
        &self,
        local_id: usize,
        name: &str,
        value: Option<Arc<Value>>,
        flags: u32,
        only: Option<ListenerHandle>,
    ) {
        // server-side tables are mostly written locally; skip the queue
        // when nobody listens for local changes
        if flags & NOTIFY_LOCAL != 0 && !self.local_notifiers() {
            return;
        }
        trace!(local_id, name, flags, "notify entry");
        self.hub.send(
            only,
            EntryNotification {
                listener: None,
                local_id,
                name: name.to_string(),
                value,
                flags,
            },
        );
    }
}

impl Deref for EntryNotifier {
    type Target = NotificationHub<EntryPolicy>;

    fn deref(&self) -> &Self::Target {
        &self.hub
    }
}
