//! Caller side of remote procedure calls.
//!
//! Every call made through [`Storage::call_rpc`](super::Storage::call_rpc)
//! owns a one-shot slot keyed by (entry local id, call uid). The response
//! fills the slot; one thread at a time may block on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;

/// Result of waiting for an RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcOutcome {
    Ready(Vec<u8>),
    TimedOut,
    Canceled,
    /// No such call, or another thread is already waiting on it
    NotPending,
}

type CallKey = (usize, u16);

#[derive(Debug, Default)]
struct SlotState {
    result: Option<Vec<u8>>,
    canceled: bool,
    waiting: bool,
}

#[derive(Debug, Default)]
struct CallSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    slots: Mutex<HashMap<CallKey, Arc<CallSlot>>>,
}

impl PendingCalls {
    /// Open a fresh slot, replacing any stale one left by a wrapped uid.
    pub(crate) fn register(
        &self,
        entry: usize,
        call_uid: u16,
    ) {
        self.slots.lock().insert((entry, call_uid), Arc::default());
    }

    /// Deliver a response. Returns `false` if nobody made that call.
    pub(crate) fn complete(
        &self,
        entry: usize,
        call_uid: u16,
        result: Vec<u8>,
    ) -> bool {
        let Some(slot) = self.slots.lock().get(&(entry, call_uid)).cloned() else {
            debug!(entry, call_uid, "dropping response to unknown rpc call");
            return false;
        };
        slot.state.lock().result = Some(result);
        slot.cond.notify_all();
        true
    }

    /// Wake the waiter on this call, or make the next wait return
    /// immediately if nobody is blocked yet.
    pub(crate) fn cancel(
        &self,
        entry: usize,
        call_uid: u16,
    ) {
        if let Some(slot) = self.slots.lock().get(&(entry, call_uid)).cloned() {
            slot.state.lock().canceled = true;
            slot.cond.notify_all();
        }
    }

    pub(crate) fn cancel_all(&self) {
        let slots: Vec<Arc<CallSlot>> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            slot.state.lock().canceled = true;
            slot.cond.notify_all();
        }
    }

    /// Block until the response arrives, the call is canceled, or the
    /// timeout elapses (`None` waits forever, zero does not block).
    pub(crate) fn wait(
        &self,
        entry: usize,
        call_uid: u16,
        timeout: Option<Duration>,
    ) -> RpcOutcome {
        let key = (entry, call_uid);
        let Some(slot) = self.slots.lock().get(&key).cloned() else {
            return RpcOutcome::NotPending;
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = slot.state.lock();
        if state.waiting {
            return RpcOutcome::NotPending;
        }
        state.waiting = true;

        loop {
            if state.canceled {
                drop(state);
                self.release(key, &slot);
                return RpcOutcome::Canceled;
            }
            if let Some(result) = state.result.take() {
                drop(state);
                self.release(key, &slot);
                return RpcOutcome::Ready(result);
            }
            match deadline {
                None => slot.cond.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.waiting = false;
                        return RpcOutcome::TimedOut;
                    }
                    slot.cond.wait_until(&mut state, deadline);
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn release(
        &self,
        key: CallKey,
        slot: &Arc<CallSlot>,
    ) {
        let mut slots = self.slots.lock();
        // a wrapped uid may have registered a newer slot meanwhile
        if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(&key);
        }
    }
}
