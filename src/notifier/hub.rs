//! Generic listener/poller notification hub
//!
//! One hub instance serves one notification category (entries, connections,
//! RPC calls, log messages). Producers call [`NotificationHub::send`], which
//! only pushes onto an unbounded channel and never blocks. A dedicated
//! dispatcher thread drains the channel, asks the category's [`HubPolicy`]
//! whether each listener wants the event, and delivers it:
//!
//! ```text
//! send(only, event) -> unbounded channel
//!                          ↓
//! Dispatcher Thread:
//!   recv -> snapshot matching listeners (hub lock held)
//!        -> release lock
//!        -> invoke callback  |  push onto poller queue + wake poll()
//! ```
//!
//! Callbacks always run with the hub lock released, so a callback may add or
//! remove listeners, or poll, without deadlocking.
//!
//! Listener and poller handles are indices into slot tables; freed slots are
//! recycled through a free-index stack.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::bounded;
use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::warn;

/// Handle of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub(crate) usize);

impl ListenerHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle of a poller queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollerHandle(pub(crate) usize);

impl PollerHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Category-specific behavior plugged into a [`NotificationHub`].
pub trait HubPolicy: Send + Sync + 'static {
    /// Per-listener selection data (prefix and mask, level range, ...)
    type Filter: Send + Sync + 'static;
    /// Payload delivered to listeners
    type Event: Clone + Send + 'static;

    fn matches(
        &self,
        filter: &Self::Filter,
        event: &Self::Event,
    ) -> bool;

    /// Record on the delivered copy which listener it is for.
    fn stamp(
        &self,
        _event: &mut Self::Event,
        _listener: ListenerHandle,
    ) {
    }
}

pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Target<E> {
    Callback(Callback<E>),
    Poller(PollerHandle),
}

impl<E> Clone for Target<E> {
    fn clone(&self) -> Self {
        match self {
            Target::Callback(cb) => Target::Callback(cb.clone()),
            Target::Poller(p) => Target::Poller(*p),
        }
    }
}

struct Listener<F, E> {
    filter: F,
    target: Target<E>,
}

/// Result of a [`NotificationHub::poll`] call.
#[derive(Debug)]
pub struct Polled<E> {
    pub events: Vec<E>,
    /// The wait ended because the timeout elapsed with nothing queued
    pub timed_out: bool,
}

impl<E> Polled<E> {
    fn empty(timed_out: bool) -> Self {
        Self {
            events: Vec::new(),
            timed_out,
        }
    }
}

struct PollerState<E> {
    events: VecDeque<E>,
    terminating: bool,
    canceling: bool,
}

struct PollerQueue<E> {
    state: Mutex<PollerState<E>>,
    cond: Condvar,
    capacity: usize,
}

impl<E> PollerQueue<E> {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PollerState {
                events: VecDeque::new(),
                terminating: false,
                canceling: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    fn push(
        &self,
        event: E,
        hub: &str,
    ) {
        let mut state = self.state.lock();
        if state.terminating {
            return;
        }
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            warn!(hub, capacity = self.capacity, "poller queue full, dropping oldest event");
        }
        state.events.push_back(event);
        drop(state);
        self.cond.notify_all();
    }

    fn terminate(&self) {
        self.state.lock().terminating = true;
        self.cond.notify_all();
    }
}

/// Slot table with a free-index stack.
pub(crate) struct Slots<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Slots<T> {
    pub(crate) fn insert(
        &mut self,
        item: T,
    ) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.items[idx] = Some(item);
                idx
            }
            None => {
                self.items.push(Some(item));
                self.items.len() - 1
            }
        }
    }

    pub(crate) fn remove(
        &mut self,
        idx: usize,
    ) -> Option<T> {
        let item = self.items.get_mut(idx)?.take();
        if item.is_some() {
            self.free.push(idx);
        }
        item
    }

    pub(crate) fn get(
        &self,
        idx: usize,
    ) -> Option<&T> {
        self.items.get(idx)?.as_ref()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|item| (i, item)))
    }

    pub(crate) fn len(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }
}

struct HubState<P: HubPolicy> {
    listeners: Slots<Listener<P::Filter, P::Event>>,
    pollers: Slots<Arc<PollerQueue<P::Event>>>,
}

struct Queued<E> {
    only: Option<ListenerHandle>,
    event: E,
}

struct HubShared<P: HubPolicy> {
    name: &'static str,
    policy: P,
    state: Mutex<HubState<P>>,
    /// Events sent but not yet fully delivered
    pending: Mutex<usize>,
    drained: Condvar,
}

impl<P: HubPolicy> HubShared<P> {
    fn dispatch(
        &self,
        queued: Queued<P::Event>,
    ) {
        let targets: Vec<(ListenerHandle, Target<P::Event>, Option<Arc<PollerQueue<P::Event>>>)> = {
            let state = self.state.lock();
            let candidates: Vec<(usize, &Listener<P::Filter, P::Event>)> = match queued.only {
                Some(handle) => state
                    .listeners
                    .get(handle.0)
                    .map(|l| vec![(handle.0, l)])
                    .unwrap_or_default(),
                None => state.listeners.iter().collect(),
            };
            candidates
                .into_iter()
                .filter(|(_, l)| self.policy.matches(&l.filter, &queued.event))
                .map(|(idx, l)| {
                    let poller = match &l.target {
                        Target::Poller(p) => state.pollers.get(p.0).cloned(),
                        Target::Callback(_) => None,
                    };
                    (ListenerHandle(idx), l.target.clone(), poller)
                })
                .collect()
        };

        for (handle, target, poller) in targets {
            let mut event = queued.event.clone();
            self.policy.stamp(&mut event, handle);
            match target {
                Target::Callback(cb) => cb(&event),
                Target::Poller(_) => {
                    if let Some(poller) = poller {
                        poller.push(event, self.name);
                    }
                }
            }
        }
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn terminate_pollers(&self) {
        let state = self.state.lock();
        for (_, poller) in state.pollers.iter() {
            poller.terminate();
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown_tx: Sender<()>,
}

/// Single-consumer-thread pub/sub engine, parameterized by a [`HubPolicy`].
pub struct NotificationHub<P: HubPolicy> {
    shared: Arc<HubShared<P>>,
    sender: Sender<Queued<P::Event>>,
    receiver: Receiver<Queued<P::Event>>,
    worker: Mutex<Option<Worker>>,
    thread_id: Mutex<Option<ThreadId>>,
    running: AtomicBool,
    poller_queue_size: usize,
}

impl<P: HubPolicy> fmt::Debug for NotificationHub<P> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("name", &self.shared.name)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: HubPolicy> NotificationHub<P> {
    pub fn new(
        name: &'static str,
        policy: P,
        poller_queue_size: usize,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(HubShared {
                name,
                policy,
                state: Mutex::new(HubState {
                    listeners: Slots::default(),
                    pollers: Slots::default(),
                }),
                pending: Mutex::new(0),
                drained: Condvar::new(),
            }),
            sender,
            receiver,
            worker: Mutex::new(None),
            thread_id: Mutex::new(None),
            running: AtomicBool::new(false),
            poller_queue_size: poller_queue_size.max(1),
        }
    }

    pub fn policy(&self) -> &P {
        &self.shared.policy
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the dispatcher thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let receiver = self.receiver.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("nt-{}-notifier", self.shared.name))
            .spawn(move || {
                debug!(hub = shared.name, "notifier thread started");
                loop {
                    crossbeam_channel::select! {
                        recv(receiver) -> result => match result {
                            Ok(queued) => {
                                shared.dispatch(queued);
                                shared.finish_one();
                            }
                            Err(_) => break,
                        },
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                shared.terminate_pollers();
                debug!(hub = shared.name, "notifier thread stopped");
            });

        match spawned {
            Ok(handle) => {
                *self.thread_id.lock() = Some(handle.thread().id());
                *worker = Some(Worker {
                    handle,
                    shutdown_tx,
                });
                self.running.store(true, Ordering::Release);
            }
            Err(e) => {
                error!(hub = self.shared.name, error = %e, "failed to spawn notifier thread");
            }
        }
    }

    /// Stop and join the dispatcher thread; blocked pollers are woken.
    /// Queued but undelivered events are discarded.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.send(());
            let on_own_thread = *self.thread_id.lock() == Some(std::thread::current().id());
            if !on_own_thread {
                let _ = worker.handle.join();
            }
        }
        while self.receiver.try_recv().is_ok() {}
        *self.shared.pending.lock() = 0;
        self.shared.drained.notify_all();
        self.shared.terminate_pollers();
    }

    /// Enqueue an event. Dropped when no dispatcher thread is running,
    /// i.e. nobody has registered interest yet.
    pub fn send(
        &self,
        only: Option<ListenerHandle>,
        event: P::Event,
    ) {
        if !self.is_running() {
            return;
        }
        *self.shared.pending.lock() += 1;
        if self.sender.send(Queued { only, event }).is_err() {
            self.shared.finish_one();
        }
    }

    pub fn add_listener(
        &self,
        filter: P::Filter,
        callback: Callback<P::Event>,
    ) -> ListenerHandle {
        self.start();
        let idx = self.shared.state.lock().listeners.insert(Listener {
            filter,
            target: Target::Callback(callback),
        });
        ListenerHandle(idx)
    }

    /// Register a listener whose events go to `poller`'s queue.
    /// Returns `None` when the poller does not exist.
    pub fn add_polled_listener(
        &self,
        poller: PollerHandle,
        filter: P::Filter,
    ) -> Option<ListenerHandle> {
        self.start();
        let mut state = self.shared.state.lock();
        state.pollers.get(poller.0)?;
        let idx = state.listeners.insert(Listener {
            filter,
            target: Target::Poller(poller),
        });
        Some(ListenerHandle(idx))
    }

    pub fn remove_listener(
        &self,
        listener: ListenerHandle,
    ) -> bool {
        self.shared.state.lock().listeners.remove(listener.0).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    pub fn create_poller(&self) -> PollerHandle {
        self.start();
        let queue = Arc::new(PollerQueue::new(self.poller_queue_size));
        PollerHandle(self.shared.state.lock().pollers.insert(queue))
    }

    /// Terminate the poller (waking any blocked `poll`) and remove every
    /// listener bound to it.
    pub fn remove_poller(
        &self,
        poller: PollerHandle,
    ) {
        let mut state = self.shared.state.lock();
        let Some(queue) = state.pollers.remove(poller.0) else {
            return;
        };
        queue.terminate();

        let bound: Vec<usize> = state
            .listeners
            .iter()
            .filter(|(_, l)| matches!(l.target, Target::Poller(p) if p == poller))
            .map(|(idx, _)| idx)
            .collect();
        for idx in bound {
            state.listeners.remove(idx);
        }
    }

    /// Wait until the poller has events, is canceled, or is removed.
    ///
    /// `timeout`: `None` blocks forever, `Some(ZERO)` does not block.
    pub fn poll(
        &self,
        poller: PollerHandle,
        timeout: Option<Duration>,
    ) -> Polled<P::Event> {
        let Some(queue) = self.shared.state.lock().pollers.get(poller.0).cloned() else {
            return Polled::empty(false);
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = queue.state.lock();
        loop {
            if !state.events.is_empty() {
                return Polled {
                    events: state.events.drain(..).collect(),
                    timed_out: false,
                };
            }
            if state.terminating {
                return Polled::empty(false);
            }
            if state.canceling {
                state.canceling = false;
                return Polled::empty(false);
            }
            match deadline {
                None => queue.cond.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Polled::empty(true);
                    }
                    queue.cond.wait_until(&mut state, deadline);
                }
            }
        }
    }

    /// Wake one blocked `poll` on this poller; remembered if nobody is
    /// blocked yet.
    pub fn cancel_poll(
        &self,
        poller: PollerHandle,
    ) {
        let queue = self.shared.state.lock().pollers.get(poller.0).cloned();
        if let Some(queue) = queue {
            queue.state.lock().canceling = true;
            queue.cond.notify_one();
        }
    }

    /// Block until every event sent so far has been delivered.
    ///
    /// Returns `false` if the timeout elapsed first. Returns `true`
    /// immediately when the hub is not running.
    pub fn wait_for_queue(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        if !self.is_running() {
            return true;
        }
        if *self.thread_id.lock() == Some(std::thread::current().id()) {
            // waiting on our own dispatcher would never finish
            return false;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            match deadline {
                None => self.shared.drained.wait(&mut pending),
                Some(deadline) => {
                    if self.shared.drained.wait_until(&mut pending, deadline).timed_out() {
                        return *pending == 0;
                    }
                }
            }
        }
        true
    }
}

impl<P: HubPolicy> Drop for NotificationHub<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
