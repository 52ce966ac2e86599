use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::StorageHandle;
use crate::constants::PROTO_REV_2_0;
use crate::constants::PROTO_REV_3_0;
use crate::network::ConnectionHandle;
use crate::network::Handshake;
use crate::network::MessageChannel;
use crate::proto::Message;

/// Asks the client connect loop to reconnect at the given revision.
pub type ReconnectHook = Arc<dyn Fn(u16) + Send + Sync>;

/// Set by the server in ServerHello when it already knew this client.
const SERVER_HELLO_RECONNECT: u8 = 0x01;

/// Collect EntryAssign messages until `done` arrives. Keep-alives are
/// skipped; anything else aborts.
async fn collect_assignments(
    channel: &mut dyn MessageChannel,
    first: Option<Arc<Message>>,
    done: fn(&Message) -> bool,
    side: &'static str,
) -> Option<Vec<Arc<Message>>> {
    let mut incoming = Vec::new();
    let mut next = first;
    loop {
        let Some(msg) = next else {
            debug!(side, "peer disconnected during initial entries");
            return None;
        };
        if done(&msg) {
            return Some(incoming);
        }
        match &*msg {
            Message::KeepAlive => {}
            Message::EntryAssign { name, id, seq_num, .. } => {
                trace!(side, name = %name, id, seq_num = seq_num.value(), "received initial assignment");
                incoming.push(msg.clone());
            }
            other => {
                debug!(
                    side,
                    msg_type = other.message_type().as_str(),
                    "received message other than entry assignment during initial handshake"
                );
                return None;
            }
        }
        next = channel.next_message().await;
    }
}

/// Client side: hello, server snapshot, reconcile, ClientHelloDone.
pub struct ClientHandshake {
    identity: String,
    storage: Arc<dyn StorageHandle>,
    reconnect: ReconnectHook,
}

impl ClientHandshake {
    pub fn new(
        identity: String,
        storage: Arc<dyn StorageHandle>,
        reconnect: ReconnectHook,
    ) -> Self {
        Self {
            identity,
            storage,
            reconnect,
        }
    }
}

#[async_trait]
impl Handshake for ClientHandshake {
    async fn handshake(
        &self,
        conn: &Arc<dyn ConnectionHandle>,
        channel: &mut dyn MessageChannel,
    ) -> bool {
        debug!(uid = conn.uid(), proto_rev = conn.proto_rev(), "client: sending hello");
        channel.send(vec![Arc::new(Message::ClientHello {
            proto_rev: conn.proto_rev(),
            identity: self.identity.clone(),
        })]);

        let Some(mut msg) = channel.next_message().await else {
            debug!("client: server disconnected before first response");
            return false;
        };

        if let Message::ProtoUnsup { proto_rev } = &*msg {
            debug!(offered = proto_rev, "client: server does not support our protocol revision");
            if *proto_rev == PROTO_REV_2_0 {
                (self.reconnect)(PROTO_REV_2_0);
            }
            return false;
        }

        if conn.proto_rev() >= PROTO_REV_3_0 {
            let Message::ServerHello { flags, identity } = &*msg else {
                debug!(msg_type = msg.message_type().as_str(), "client: expected server hello");
                return false;
            };
            conn.set_remote_id(identity.clone());
            if flags & SERVER_HELLO_RECONNECT != 0 {
                debug!(server = %identity, "client: server already knew this client");
            }
            let Some(next) = channel.next_message().await else {
                debug!("client: server disconnected after hello");
                return false;
            };
            msg = next;
        }

        let Some(incoming) =
            collect_assignments(channel, Some(msg), |m| matches!(m, Message::ServerHelloDone), "client").await
        else {
            return false;
        };

        let mut outgoing = self.storage.apply_initial_assignments(conn.as_ref(), incoming);
        if conn.proto_rev() >= PROTO_REV_3_0 {
            outgoing.push(Arc::new(Message::ClientHelloDone));
        }
        if !outgoing.is_empty() {
            channel.send(outgoing);
        }

        info!(
            uid = conn.uid(),
            server = %conn.remote_id(),
            proto_rev = conn.proto_rev(),
            "client: connected to server"
        );
        true
    }
}

/// Server side: hello, full snapshot, and with 3.0 peers the client's own
/// assignments up to ClientHelloDone.
pub struct ServerHandshake {
    identity: String,
    storage: Arc<dyn StorageHandle>,
}

impl ServerHandshake {
    pub fn new(
        identity: String,
        storage: Arc<dyn StorageHandle>,
    ) -> Self {
        Self { identity, storage }
    }
}

#[async_trait]
impl Handshake for ServerHandshake {
    async fn handshake(
        &self,
        conn: &Arc<dyn ConnectionHandle>,
        channel: &mut dyn MessageChannel,
    ) -> bool {
        let Some(msg) = channel.next_message().await else {
            debug!("server: client disconnected before sending hello");
            return false;
        };
        let Message::ClientHello { proto_rev, identity } = &*msg else {
            debug!(msg_type = msg.message_type().as_str(), "server: client initial message was not client hello");
            return false;
        };
        let proto_rev = *proto_rev;

        if proto_rev > PROTO_REV_3_0 {
            debug!(requested = proto_rev, "server: client requested unsupported protocol revision");
            channel.send(vec![Arc::new(Message::ProtoUnsup {
                proto_rev: PROTO_REV_3_0,
            })]);
            return false;
        }

        if proto_rev >= PROTO_REV_3_0 {
            conn.set_remote_id(identity.clone());
        }
        debug!(uid = conn.uid(), proto_rev, "server: client protocol");
        conn.set_proto_rev(proto_rev);

        let mut outgoing = Vec::new();
        if proto_rev >= PROTO_REV_3_0 {
            outgoing.push(Arc::new(Message::ServerHello {
                flags: 0,
                identity: self.identity.clone(),
            }));
        }
        outgoing.extend(self.storage.get_initial_assignments(conn.as_ref()));
        outgoing.push(Arc::new(Message::ServerHelloDone));
        debug!(count = outgoing.len(), "server: sending initial assignments");
        channel.send(outgoing);

        // 2.0 clients have no ClientHelloDone; their assignments arrive
        // with normal traffic
        if proto_rev >= PROTO_REV_3_0 {
            let first = channel.next_message().await;
            let Some(incoming) =
                collect_assignments(channel, first, |m| matches!(m, Message::ClientHelloDone), "server").await
            else {
                return false;
            };
            for msg in incoming {
                self.storage.process_incoming(msg, conn);
            }
        }

        info!(
            uid = conn.uid(),
            client = %conn.remote_id(),
            proto_rev,
            "server: client connected"
        );
        true
    }
}
