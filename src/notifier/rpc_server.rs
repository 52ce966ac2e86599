//! Server side of remote procedure calls.
//!
//! Incoming calls are delivered to the listener registered for the RPC entry
//! (callback or poller). The reply path for each call is parked in a
//! responder map keyed by (entry local id, call uid) until the application
//! posts a result; the first result posted wins.

use std::ops::Deref;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::HubPolicy;
use super::ListenerHandle;
use super::NotificationHub;
use super::PollerHandle;
use crate::network::ConnectionInfo;

/// Delivers one RPC result back to the caller.
pub type RpcResponder = Box<dyn FnOnce(Vec<u8>) + Send + Sync>;

type ResponderMap = DashMap<(usize, u16), RpcResponder>;

/// One incoming call awaiting an answer.
#[derive(Debug, Clone)]
pub struct RpcAnswer {
    /// Local id of the RPC entry
    pub entry: usize,
    pub call_uid: u16,
    pub name: String,
    pub params: Vec<u8>,
    /// Caller connection; empty remote id for local calls
    pub conn: ConnectionInfo,
    pub listener: Option<ListenerHandle>,
}

#[derive(Debug, Default)]
pub struct RpcPolicy;

impl HubPolicy for RpcPolicy {
    type Filter = ();
    type Event = RpcAnswer;

    fn matches(
        &self,
        _filter: &(),
        _event: &RpcAnswer,
    ) -> bool {
        true
    }

    fn stamp(
        &self,
        event: &mut RpcAnswer,
        listener: ListenerHandle,
    ) {
        event.listener = Some(listener);
    }
}

pub struct RpcServer {
    hub: NotificationHub<RpcPolicy>,
    responders: Arc<ResponderMap>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("hub", &self.hub)
            .field("pending", &self.responders.len())
            .finish()
    }
}

impl RpcServer {
    pub fn new(poller_queue_size: usize) -> Self {
        Self {
            hub: NotificationHub::new("rpc", RpcPolicy, poller_queue_size),
            responders: Arc::new(DashMap::new()),
        }
    }

    /// Register a callback answering calls synchronously with its return
    /// value. The returned handle is the RPC uid to store on the entry.
    pub fn add_rpc<F>(
        &self,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(&RpcAnswer) -> Vec<u8> + Send + Sync + 'static,
    {
        let responders = Arc::downgrade(&self.responders);
        self.hub.add_listener(
            (),
            Arc::new(move |answer: &RpcAnswer| {
                let result = callback(answer);
                if let Some(responders) = responders.upgrade() {
                    post_response(&responders, answer.entry, answer.call_uid, result);
                }
            }),
        )
    }

    /// Register a poller-backed RPC; answer with [`RpcServer::post_rpc_response`].
    pub fn add_polled_rpc(
        &self,
        poller: PollerHandle,
    ) -> Option<ListenerHandle> {
        self.hub.add_polled_listener(poller, ())
    }

    /// Deliver an incoming call to the listener `rpc_uid`, parking the
    /// responder until a result is posted.
    pub fn process_rpc(
        &self,
        entry: usize,
        call_uid: u16,
        name: &str,
        params: Vec<u8>,
        conn: ConnectionInfo,
        responder: RpcResponder,
        rpc_uid: ListenerHandle,
    ) {
        self.responders.insert((entry, call_uid), responder);
        self.hub.send(
            Some(rpc_uid),
            RpcAnswer {
                entry,
                call_uid,
                name: name.to_string(),
                params,
                conn,
                listener: None,
            },
        );
    }

    /// Send the result for a pending call. Returns `false` if the call is
    /// unknown or already answered.
    pub fn post_rpc_response(
        &self,
        entry: usize,
        call_uid: u16,
        result: Vec<u8>,
    ) -> bool {
        post_response(&self.responders, entry, call_uid, result)
    }

    pub fn pending_calls(&self) -> usize {
        self.responders.len()
    }
}

fn post_response(
    responders: &ResponderMap,
    entry: usize,
    call_uid: u16,
    result: Vec<u8>,
) -> bool {
    match responders.remove(&(entry, call_uid)) {
        Some((_, responder)) => {
            responder(result);
            true
        }
        None => {
            debug!(entry, call_uid, "posting response to unknown rpc call");
            false
        }
    }
}

impl Deref for RpcServer {
    type Target = NotificationHub<RpcPolicy>;

    fn deref(&self) -> &Self::Target {
        &self.hub
    }
}
