use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::persistence;
use super::persistence::NamedValue;
use super::rpc::PendingCalls;
use super::Entry;
use super::EntryInfo;
use super::OutgoingQueue;
use super::RpcOutcome;
use crate::constants::ENTRY_PERSISTENT;
use crate::constants::NOTIFY_DELETE;
use crate::constants::NOTIFY_FLAGS;
use crate::constants::NOTIFY_IMMEDIATE;
use crate::constants::NOTIFY_LOCAL;
use crate::constants::NOTIFY_NEW;
use crate::constants::NOTIFY_UPDATE;
use crate::constants::PROTO_REV_3_0;
use crate::constants::UNASSIGNED_ID;
use crate::errors::EntryError;
use crate::errors::StorageError;
use crate::metrics::PERSIST_SAVE_FAILURES;
use crate::network::ConnectionHandle;
use crate::network::ConnectionId;
use crate::network::ConnectionInfo;
use crate::network::ConnectionState;
use crate::notifier::Callback;
use crate::notifier::EntryNotification;
use crate::notifier::EntryNotifier;
use crate::notifier::EntrySelector;
use crate::notifier::ListenerHandle;
use crate::notifier::PollerHandle;
use crate::notifier::RpcServer;
use crate::proto::Message;
use crate::proto::SequenceNumber;
use crate::proto::Value;
use crate::proto::ValueType;
use crate::utils::time::get_now_as_micros;
use crate::Result;

/// A message for the dispatcher, held until the table lock is released.
struct Outgoing {
    msg: Arc<Message>,
    only: Option<ConnectionId>,
    except: Option<ConnectionId>,
}

impl Outgoing {
    fn all(msg: Arc<Message>) -> Self {
        Self {
            msg,
            only: None,
            except: None,
        }
    }

    fn except(
        msg: Arc<Message>,
        conn: ConnectionId,
    ) -> Self {
        Self {
            msg,
            only: None,
            except: Some(conn),
        }
    }
}

#[derive(Default)]
struct StorageState {
    entries: Vec<Entry>,
    names: HashMap<String, usize>,
    /// wire id -> local id
    id_map: Vec<Option<usize>>,
    persistent_dirty: bool,
    server: bool,
    dispatcher: Option<Weak<dyn OutgoingQueue>>,
}

impl StorageState {
    fn lookup(
        &self,
        name: &str,
    ) -> Option<usize> {
        self.names.get(name).copied()
    }

    fn get_or_new(
        &mut self,
        name: &str,
    ) -> usize {
        if let Some(idx) = self.names.get(name) {
            return *idx;
        }
        let idx = self.entries.len();
        self.entries.push(Entry::new(name, idx));
        self.names.insert(name.to_string(), idx);
        idx
    }

    fn by_id(
        &self,
        id: u16,
    ) -> Option<usize> {
        self.id_map.get(id as usize).copied().flatten()
    }

    /// Give the entry the next wire id (server only).
    fn assign_id(
        &mut self,
        idx: usize,
    ) {
        let id = self.id_map.len();
        if id >= UNASSIGNED_ID as usize {
            warn!(name = %self.entries[idx].name, "wire id space exhausted");
            return;
        }
        self.entries[idx].id = id as u16;
        self.id_map.push(Some(idx));
    }

    fn map_id(
        &mut self,
        id: u16,
        idx: usize,
    ) {
        let pos = id as usize;
        if pos >= self.id_map.len() {
            self.id_map.resize(pos + 1, None);
        }
        self.id_map[pos] = Some(idx);
    }

    fn unmap_id(
        &mut self,
        id: u16,
    ) {
        if let Some(slot) = self.id_map.get_mut(id as usize) {
            *slot = None;
        }
    }

    fn dispatcher(&self) -> Option<Arc<dyn OutgoingQueue>> {
        self.dispatcher.as_ref().and_then(Weak::upgrade)
    }

    fn has_dispatcher(&self) -> bool {
        self.dispatcher
            .as_ref()
            .is_some_and(|d| d.strong_count() > 0)
    }

    /// Store a value and generate the matching notification and message.
    /// `local` marks writes made through the public API.
    fn set_value(
        &mut self,
        notifier: &EntryNotifier,
        idx: usize,
        value: Arc<Value>,
        local: bool,
        out: &mut Vec<Outgoing>,
    ) {
        let server = self.server;
        let has_dispatcher = self.has_dispatcher();
        if server && self.entries[idx].id == UNASSIGNED_ID {
            self.assign_id(idx);
        }

        let entry = &mut self.entries[idx];
        let old = entry.replace_value(value.clone());
        let changed = old.as_deref() != Some(&*value);
        let dirty = entry.is_persistent() && changed;

        let local_flag = if local { NOTIFY_LOCAL } else { 0 };
        if old.is_none() {
            notifier.notify_entry(idx, &entry.name, Some(value.clone()), NOTIFY_NEW | local_flag, None);
        } else if changed {
            notifier.notify_entry(idx, &entry.name, Some(value.clone()), NOTIFY_UPDATE | local_flag, None);
        }
        if local {
            entry.local_write = true;
        }

        let type_changed = old.as_ref().map(|v| v.value_type()) != Some(value.value_type());
        let msg = if type_changed {
            if local {
                entry.seq_num.increment();
            }
            Some(Message::entry_assign(
                entry.name.clone(),
                entry.id,
                entry.seq_num,
                value,
                entry.flags,
            ))
        } else if changed {
            if local {
                entry.seq_num.increment();
            }
            // an update needs an id; the pending assign will carry the value
            (entry.id != UNASSIGNED_ID).then(|| Message::entry_update(entry.id, entry.seq_num, value))
        } else {
            None
        };

        if dirty {
            self.persistent_dirty = true;
        }
        if has_dispatcher && (local || server) {
            out.extend(msg.map(Outgoing::all));
        }
    }

    fn set_flags(
        &mut self,
        notifier: &EntryNotifier,
        idx: usize,
        flags: u8,
        local: bool,
        out: &mut Vec<Outgoing>,
    ) {
        let entry = &mut self.entries[idx];
        if entry.flags == flags {
            return;
        }
        let dirty = (entry.flags ^ flags) & ENTRY_PERSISTENT != 0;
        entry.flags = flags;

        let local_flag = if local { NOTIFY_LOCAL } else { 0 };
        notifier.notify_entry(idx, &entry.name, entry.value.clone(), NOTIFY_FLAGS | local_flag, None);

        let id = entry.id;
        if dirty {
            self.persistent_dirty = true;
        }
        if local && id != UNASSIGNED_ID && self.has_dispatcher() {
            out.push(Outgoing::all(Message::flags_update(id, flags)));
        }
    }

    fn delete(
        &mut self,
        notifier: &EntryNotifier,
        rpc_server: &RpcServer,
        idx: usize,
        local: bool,
        out: &mut Vec<Outgoing>,
    ) {
        let entry = &mut self.entries[idx];
        let id = entry.id;
        let old = entry.value.take();
        entry.id = UNASSIGNED_ID;
        entry.local_write = false;
        if let Some(uid) = entry.rpc_uid.take() {
            rpc_server.remove_listener(uid);
        }
        let dirty = entry.is_persistent();
        entry.flags = 0;

        if let Some(old) = &old {
            let local_flag = if local { NOTIFY_LOCAL } else { 0 };
            notifier.notify_entry(idx, &entry.name, Some(old.clone()), NOTIFY_DELETE | local_flag, None);
        }

        if id != UNASSIGNED_ID {
            self.unmap_id(id);
        }
        if dirty {
            self.persistent_dirty = true;
        }
        if old.is_some() && local && id != UNASSIGNED_ID && self.has_dispatcher() {
            out.push(Outgoing::all(Message::entry_delete(id)));
        }
    }

    /// Delete every valued entry selected by `pred`. Returns whether
    /// anything was deleted.
    fn delete_all(
        &mut self,
        notifier: &EntryNotifier,
        rpc_server: &RpcServer,
        local: bool,
        pred: impl Fn(&Entry) -> bool,
    ) -> bool {
        let local_flag = if local { NOTIFY_LOCAL } else { 0 };
        let mut deleted = false;
        let mut freed_ids = Vec::new();
        let mut dirty = false;
        for entry in self.entries.iter_mut() {
            if entry.value.is_none() || !pred(entry) {
                continue;
            }
            let old = entry.value.take();
            notifier.notify_entry(entry.local_id, &entry.name, old, NOTIFY_DELETE | local_flag, None);
            if entry.id != UNASSIGNED_ID {
                freed_ids.push(entry.id);
            }
            if let Some(uid) = entry.rpc_uid.take() {
                rpc_server.remove_listener(uid);
            }
            dirty |= entry.is_persistent();
            entry.id = UNASSIGNED_ID;
            entry.local_write = false;
            deleted = true;
        }
        for id in freed_ids {
            self.unmap_id(id);
        }
        if dirty {
            self.persistent_dirty = true;
        }
        deleted
    }

    fn collect(
        &self,
        pred: impl Fn(&Entry) -> bool,
    ) -> Vec<NamedValue> {
        let mut entries: Vec<NamedValue> = self
            .entries
            .iter()
            .filter(|e| pred(e))
            .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// The entry table.
pub struct Storage {
    state: Mutex<StorageState>,
    notifier: Arc<EntryNotifier>,
    rpc_server: Arc<RpcServer>,
    calls: Arc<PendingCalls>,
}

impl std::fmt::Debug for Storage {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Storage")
            .field("entries", &state.entries.len())
            .field("server", &state.server)
            .field("persistent_dirty", &state.persistent_dirty)
            .finish()
    }
}

impl Storage {
    pub fn new(
        notifier: Arc<EntryNotifier>,
        rpc_server: Arc<RpcServer>,
    ) -> Self {
        Self {
            // a table with no network attached behaves as its own server
            state: Mutex::new(StorageState {
                server: true,
                ..Default::default()
            }),
            notifier,
            rpc_server,
            calls: Arc::new(PendingCalls::default()),
        }
    }

    pub fn notifier(&self) -> &Arc<EntryNotifier> {
        &self.notifier
    }

    pub fn rpc_server(&self) -> &Arc<RpcServer> {
        &self.rpc_server
    }

    pub fn is_server(&self) -> bool {
        self.state.lock().server
    }

    fn send(
        dispatcher: Option<Arc<dyn OutgoingQueue>>,
        out: Vec<Outgoing>,
    ) {
        let Some(dispatcher) = dispatcher else {
            return;
        };
        for o in out {
            dispatcher.queue_outgoing(o.msg, o.only, o.except);
        }
    }

    // -
    // Dispatcher side

    /// Attach the network side. `server` selects the server role for id
    /// assignment and rebroadcast.
    pub fn set_dispatcher(
        &self,
        dispatcher: Weak<dyn OutgoingQueue>,
        server: bool,
    ) {
        let mut state = self.state.lock();
        state.dispatcher = Some(dispatcher);
        state.server = server;
    }

    pub fn clear_dispatcher(&self) {
        self.state.lock().dispatcher = None;
    }

    /// Type of the entry with wire id `id`, for decoding 2.0 updates.
    pub fn get_message_entry_type(
        &self,
        id: u16,
    ) -> Option<ValueType> {
        let state = self.state.lock();
        let idx = state.by_id(id)?;
        state.entries[idx].value.as_ref().map(|v| v.value_type())
    }

    /// Apply one message received after the handshake.
    pub fn process_incoming(
        &self,
        msg: Arc<Message>,
        conn: &Arc<dyn ConnectionHandle>,
    ) {
        trace!(conn = conn.uid(), msg_type = msg.message_type().as_str(), "process incoming");
        match &*msg {
            Message::KeepAlive
            | Message::ClientHello { .. }
            | Message::ProtoUnsup { .. }
            | Message::ServerHello { .. }
            | Message::ServerHelloDone
            | Message::ClientHelloDone => {
                debug!(conn = conn.uid(), msg_type = msg.message_type().as_str(), "ignoring handshake message");
            }
            Message::EntryAssign { .. } => self.process_entry_assign(&msg, conn),
            Message::EntryUpdate { id, seq_num, value } => {
                self.process_entry_update(&msg, *id, *seq_num, value, conn.uid())
            }
            Message::FlagsUpdate { id, flags } => self.process_flags_update(&msg, *id, *flags, conn.uid()),
            Message::EntryDelete { id } => self.process_entry_delete(&msg, *id, conn.uid()),
            Message::ClearEntries => self.process_clear_entries(&msg, conn.uid()),
            Message::ExecuteRpc { id, call_uid, params } => {
                self.process_execute_rpc(*id, *call_uid, params.clone(), conn)
            }
            Message::RpcResponse { id, call_uid, result } => {
                self.process_rpc_response(*id, *call_uid, result.clone())
            }
        }
    }

    fn process_entry_assign(
        &self,
        msg: &Arc<Message>,
        conn: &Arc<dyn ConnectionHandle>,
    ) {
        let Message::EntryAssign {
            name,
            id,
            seq_num,
            value,
            flags,
        } = &**msg
        else {
            return;
        };
        let (id, seq_num, flags) = (*id, *seq_num, *flags);

        let mut out = Vec::new();
        let dispatcher = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut may_need_update = false;

            let idx = if state.server {
                // an unassigned id asks the server to allocate one
                if id == UNASSIGNED_ID {
                    let idx = state.get_or_new(name);
                    if state.entries[idx].id != UNASSIGNED_ID {
                        return;
                    }
                    state.entries[idx].flags = flags;
                    state.entries[idx].seq_num = seq_num;
                    state.set_value(&self.notifier, idx, value.clone(), false, &mut out);
                    let dispatcher = state.dispatcher();
                    drop(guard);
                    Self::send(dispatcher, out);
                    return;
                }
                match state.by_id(id) {
                    Some(idx) => idx,
                    None => {
                        debug!(id, "server: received assignment to unknown entry");
                        return;
                    }
                }
            } else {
                if id == UNASSIGNED_ID {
                    debug!("client: received entry assignment request");
                    return;
                }
                match state.by_id(id) {
                    Some(idx) => idx,
                    None => {
                        let idx = state.get_or_new(name);
                        state.entries[idx].id = id;
                        state.map_id(id, idx);
                        let entry = &mut state.entries[idx];
                        if entry.value.is_none() {
                            entry.replace_value(value.clone());
                            entry.flags = flags;
                            entry.seq_num = seq_num;
                            self.notifier.notify_entry(idx, name, Some(value.clone()), NOTIFY_NEW, None);
                            return;
                        }
                        // reply to our own id request
                        may_need_update = true;
                        if flags != entry.flags {
                            out.push(Outgoing::all(Message::flags_update(id, entry.flags)));
                        }
                        idx
                    }
                }
            };

            let entry = &mut state.entries[idx];
            if !matches!(seq_num.partial_cmp(&entry.seq_num), Some(o) if o.is_ge()) {
                if may_need_update {
                    if let Some(current) = entry.value.clone() {
                        out.push(Outgoing::all(Message::entry_update(entry.id, entry.seq_num, current)));
                    }
                }
                let dispatcher = state.dispatcher();
                drop(guard);
                Self::send(dispatcher, out);
                return;
            }

            if *name != entry.name {
                debug!(id, name = %name, existing = %entry.name, "entry assignment for same id with different name");
                return;
            }

            let mut notify_flags = NOTIFY_UPDATE;
            let mut dirty = false;
            // 2.0 assigns do not carry flags; a reply to our id request
            // keeps our flags
            if !may_need_update && conn.proto_rev() >= PROTO_REV_3_0 {
                if (entry.flags ^ flags) & ENTRY_PERSISTENT != 0 {
                    dirty = true;
                }
                if entry.flags != flags {
                    notify_flags |= NOTIFY_FLAGS;
                }
                entry.flags = flags;
            }
            if entry.is_persistent() && entry.value.as_deref() != Some(&**value) {
                dirty = true;
            }

            entry.replace_value(value.clone());
            entry.seq_num = seq_num;
            self.notifier
                .notify_entry(idx, &entry.name, Some(value.clone()), notify_flags, None);

            if state.server {
                out.push(Outgoing::except(
                    Message::entry_assign(entry.name.clone(), id, seq_num, value.clone(), entry.flags),
                    conn.uid(),
                ));
            }
            if dirty {
                state.persistent_dirty = true;
            }
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    fn process_entry_update(
        &self,
        msg: &Arc<Message>,
        id: u16,
        seq_num: SequenceNumber,
        value: &Arc<Value>,
        conn: ConnectionId,
    ) {
        let dispatcher = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(idx) = state.by_id(id) else {
                debug!(id, "received update to unknown entry");
                return;
            };
            let entry = &mut state.entries[idx];
            // equal or unordered counts as stale
            if !matches!(seq_num.partial_cmp(&entry.seq_num), Some(std::cmp::Ordering::Greater)) {
                return;
            }
            entry.replace_value(value.clone());
            entry.seq_num = seq_num;
            self.notifier
                .notify_entry(idx, &entry.name, Some(value.clone()), NOTIFY_UPDATE, None);
            if entry.is_persistent() {
                state.persistent_dirty = true;
            }
            if !state.server {
                return;
            }
            state.dispatcher()
        };
        Self::send(dispatcher, vec![Outgoing::except(msg.clone(), conn)]);
    }

    fn process_flags_update(
        &self,
        msg: &Arc<Message>,
        id: u16,
        flags: u8,
        conn: ConnectionId,
    ) {
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let Some(idx) = state.by_id(id) else {
                debug!(id, "received flags update to unknown entry");
                return;
            };
            state.set_flags(&self.notifier, idx, flags, false, &mut out);
            if state.server {
                out.push(Outgoing::except(msg.clone(), conn));
            }
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    fn process_entry_delete(
        &self,
        msg: &Arc<Message>,
        id: u16,
        conn: ConnectionId,
    ) {
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let Some(idx) = state.by_id(id) else {
                debug!(id, "received delete to unknown entry");
                return;
            };
            state.delete(&self.notifier, &self.rpc_server, idx, false, &mut out);
            if state.server {
                out.push(Outgoing::except(msg.clone(), conn));
            }
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    fn process_clear_entries(
        &self,
        msg: &Arc<Message>,
        conn: ConnectionId,
    ) {
        let dispatcher = {
            let mut state = self.state.lock();
            state.delete_all(&self.notifier, &self.rpc_server, false, |e| !e.is_persistent());
            if !state.server {
                return;
            }
            state.dispatcher()
        };
        Self::send(dispatcher, vec![Outgoing::except(msg.clone(), conn)]);
    }

    fn process_execute_rpc(
        &self,
        id: u16,
        call_uid: u16,
        params: Vec<u8>,
        conn: &Arc<dyn ConnectionHandle>,
    ) {
        let (idx, name, rpc_uid) = {
            let state = self.state.lock();
            if !state.server {
                return;
            }
            let Some(idx) = state.by_id(id) else {
                debug!(id, "received rpc call to unknown entry");
                return;
            };
            let entry = &state.entries[idx];
            let is_rpc = entry.value.as_ref().is_some_and(|v| v.is_rpc());
            let Some(rpc_uid) = entry.rpc_uid.filter(|_| is_rpc) else {
                debug!(id, name = %entry.name, "received rpc call to non-rpc entry");
                return;
            };
            (idx, entry.name.clone(), rpc_uid)
        };

        let caller: Weak<dyn ConnectionHandle> = Arc::downgrade(conn);
        self.rpc_server.process_rpc(
            idx,
            call_uid,
            &name,
            params,
            conn.info(),
            Box::new(move |result| {
                if let Some(caller) = caller.upgrade() {
                    caller.queue_outgoing(Message::rpc_response(id, call_uid, result));
                }
            }),
            rpc_uid,
        );
    }

    fn process_rpc_response(
        &self,
        id: u16,
        call_uid: u16,
        result: Vec<u8>,
    ) {
        let idx = {
            let state = self.state.lock();
            if state.server {
                return;
            }
            let Some(idx) = state.by_id(id) else {
                debug!(id, "received rpc response to unknown entry");
                return;
            };
            if !state.entries[idx].value.as_ref().is_some_and(|v| v.is_rpc()) {
                debug!(id, "received rpc response to non-rpc entry");
                return;
            }
            idx
        };
        self.calls.complete(idx, call_uid, result);
    }

    /// Snapshot of every valued entry for a connecting client. Marks the
    /// connection synchronized so later broadcasts reach it.
    pub fn get_initial_assignments(
        &self,
        conn: &dyn ConnectionHandle,
    ) -> Vec<Arc<Message>> {
        let state = self.state.lock();
        conn.set_state(ConnectionState::Synchronized);
        state
            .entries
            .iter()
            .filter_map(|e| {
                e.value.as_ref().map(|v| {
                    Message::entry_assign(e.name.clone(), e.id, e.seq_num, v.clone(), e.flags)
                })
            })
            .collect()
    }

    /// Reconcile the server's snapshot into the local table (client only).
    ///
    /// Local writes to non-persistent entries win and are queued back as
    /// updates. Returns assigns for locally created entries the server does
    /// not know, to be sent before ClientHelloDone.
    pub fn apply_initial_assignments(
        &self,
        conn: &dyn ConnectionHandle,
        msgs: Vec<Arc<Message>>,
    ) -> Vec<Arc<Message>> {
        let mut updates = Vec::new();
        let mut assigns = Vec::new();
        let dispatcher = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.server {
                return assigns;
            }
            conn.set_state(ConnectionState::Synchronized);

            for entry in state.entries.iter_mut() {
                entry.id = UNASSIGNED_ID;
            }
            state.id_map.clear();

            for msg in msgs {
                let Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value,
                    flags,
                } = &*msg
                else {
                    debug!(msg_type = msg.message_type().as_str(), "client: received non-assign in initial assignments");
                    continue;
                };
                if *id == UNASSIGNED_ID {
                    debug!("client: received entry assignment request");
                    continue;
                }

                let idx = state.get_or_new(name);
                let entry = &mut state.entries[idx];
                entry.seq_num = *seq_num;
                entry.id = *id;
                if entry.value.is_none() {
                    entry.replace_value(value.clone());
                    entry.flags = *flags;
                    self.notifier.notify_entry(idx, name, Some(value.clone()), NOTIFY_NEW, None);
                } else if entry.local_write && !entry.is_persistent() {
                    entry.seq_num.increment();
                    if let Some(current) = entry.value.clone() {
                        updates.push(Outgoing::all(Message::entry_update(*id, entry.seq_num, current)));
                    }
                } else {
                    entry.replace_value(value.clone());
                    let mut notify_flags = NOTIFY_UPDATE;
                    if conn.proto_rev() >= PROTO_REV_3_0 {
                        if entry.flags != *flags {
                            notify_flags |= NOTIFY_FLAGS;
                        }
                        entry.flags = *flags;
                    }
                    self.notifier
                        .notify_entry(idx, name, Some(value.clone()), notify_flags, None);
                }
                state.map_id(*id, idx);
            }

            // local entries the server did not send: resend ours, drop the rest
            for entry in state.entries.iter() {
                if entry.id != UNASSIGNED_ID || !entry.local_write {
                    continue;
                }
                if let Some(value) = &entry.value {
                    assigns.push(Message::unassigned_entry(
                        entry.name.clone(),
                        entry.seq_num,
                        value.clone(),
                        entry.flags,
                    ));
                }
            }
            state.delete_all(&self.notifier, &self.rpc_server, false, |e| {
                e.id == UNASSIGNED_ID && !e.local_write
            });
            state.dispatcher()
        };
        Self::send(dispatcher, updates);
        assigns
    }

    // -
    // Entry API

    /// Local id for `name`, creating an empty entry if needed.
    pub fn get_entry(
        &self,
        name: &str,
    ) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        Some(self.state.lock().get_or_new(name))
    }

    /// Local ids of valued entries under `prefix` whose type matches the
    /// `types` mask (0 = any).
    pub fn get_entries(
        &self,
        prefix: &str,
        types: u32,
    ) -> Vec<usize> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| {
                e.name.starts_with(prefix)
                    && e.value
                        .as_ref()
                        .is_some_and(|v| v.value_type().matches_filter(types))
            })
            .map(|e| e.local_id)
            .collect()
    }

    pub fn get_entry_infos(
        &self,
        prefix: &str,
        types: u32,
    ) -> Vec<EntryInfo> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| {
                e.name.starts_with(prefix)
                    && e.value
                        .as_ref()
                        .is_some_and(|v| v.value_type().matches_filter(types))
            })
            .map(Entry::info)
            .collect()
    }

    pub fn get_entry_info(
        &self,
        local_id: usize,
    ) -> Option<EntryInfo> {
        self.state.lock().entries.get(local_id).map(Entry::info)
    }

    pub fn get_entry_name(
        &self,
        local_id: usize,
    ) -> Option<String> {
        self.state.lock().entries.get(local_id).map(|e| e.name.clone())
    }

    pub fn get_entry_type(
        &self,
        local_id: usize,
    ) -> ValueType {
        self.state
            .lock()
            .entries
            .get(local_id)
            .map(Entry::value_type)
            .unwrap_or(ValueType::Unassigned)
    }

    pub fn get_entry_last_change(
        &self,
        local_id: usize,
    ) -> u64 {
        self.state
            .lock()
            .entries
            .get(local_id)
            .map(|e| e.last_change)
            .unwrap_or_default()
    }

    pub fn get_entry_value(
        &self,
        name: &str,
    ) -> Option<Arc<Value>> {
        let state = self.state.lock();
        let idx = state.lookup(name)?;
        state.entries[idx].value.clone()
    }

    pub fn get_entry_value_by_id(
        &self,
        local_id: usize,
    ) -> Option<Arc<Value>> {
        self.state.lock().entries.get(local_id)?.value.clone()
    }

    /// Set a value, failing if the entry already holds a different type.
    /// An empty name is ignored.
    pub fn set_entry_value(
        &self,
        name: &str,
        value: Value,
    ) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        let value = Arc::new(value);
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let idx = state.get_or_new(name);
            let existing = state.entries[idx].value_type();
            if existing != ValueType::Unassigned && existing != value.value_type() {
                return Err(EntryError::TypeMismatch {
                    name: name.to_string(),
                    existing,
                    requested: value.value_type(),
                }
                .into());
            }
            state.set_value(&self.notifier, idx, value, true, &mut out);
            state.dispatcher()
        };
        Self::send(dispatcher, out);
        Ok(())
    }

    /// Set only if the entry has no value. Returns whether the entry ends up
    /// with the requested type.
    pub fn set_default_entry_value(
        &self,
        name: &str,
        value: Value,
    ) -> bool {
        if name.is_empty() {
            return false;
        }
        let value = Arc::new(value);
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let idx = state.get_or_new(name);
            if let Some(existing) = &state.entries[idx].value {
                return existing.value_type() == value.value_type();
            }
            state.set_value(&self.notifier, idx, value, true, &mut out);
            state.dispatcher()
        };
        Self::send(dispatcher, out);
        true
    }

    /// Set regardless of the current type.
    pub fn set_entry_type_value(
        &self,
        name: &str,
        value: Value,
    ) {
        if name.is_empty() {
            return;
        }
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let idx = state.get_or_new(name);
            state.set_value(&self.notifier, idx, Arc::new(value), true, &mut out);
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    pub fn set_entry_flags(
        &self,
        name: &str,
        flags: u8,
    ) {
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let Some(idx) = state.lookup(name) else {
                return;
            };
            state.set_flags(&self.notifier, idx, flags, true, &mut out);
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    pub fn get_entry_flags(
        &self,
        name: &str,
    ) -> u8 {
        let state = self.state.lock();
        state
            .lookup(name)
            .map(|idx| state.entries[idx].flags)
            .unwrap_or_default()
    }

    pub fn delete_entry(
        &self,
        name: &str,
    ) {
        let mut out = Vec::new();
        let dispatcher = {
            let mut state = self.state.lock();
            let Some(idx) = state.lookup(name) else {
                return;
            };
            state.delete(&self.notifier, &self.rpc_server, idx, true, &mut out);
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    /// Delete every non-persistent entry.
    pub fn delete_all_entries(&self) {
        let dispatcher = {
            let mut state = self.state.lock();
            if state.entries.is_empty() {
                return;
            }
            state.delete_all(&self.notifier, &self.rpc_server, true, |e| !e.is_persistent());
            state.dispatcher()
        };
        Self::send(dispatcher, vec![Outgoing::all(Message::clear_entries())]);
    }

    // -
    // Listeners

    /// Register an entry listener. With IMMEDIATE and NEW in `flags`, the
    /// listener is first told about every matching entry that has a value.
    pub fn add_listener(
        &self,
        selector: EntrySelector,
        flags: u32,
        callback: Callback<EntryNotification>,
    ) -> ListenerHandle {
        let state = self.state.lock();
        let uid = self.notifier.add(selector.clone(), flags, callback);
        self.notify_immediate(&state, &selector, flags, uid);
        uid
    }

    pub fn add_polled_listener(
        &self,
        poller: PollerHandle,
        selector: EntrySelector,
        flags: u32,
    ) -> Option<ListenerHandle> {
        let state = self.state.lock();
        let uid = self.notifier.add_polled(poller, selector.clone(), flags)?;
        self.notify_immediate(&state, &selector, flags, uid);
        Some(uid)
    }

    fn notify_immediate(
        &self,
        state: &StorageState,
        selector: &EntrySelector,
        flags: u32,
        uid: ListenerHandle,
    ) {
        if flags & NOTIFY_IMMEDIATE == 0 || flags & NOTIFY_NEW == 0 {
            return;
        }
        let selected = state.entries.iter().filter(|e| match selector {
            EntrySelector::Prefix(prefix) => e.name.starts_with(prefix.as_str()),
            EntrySelector::Entry(local_id) => e.local_id == *local_id,
        });
        for entry in selected {
            if let Some(value) = &entry.value {
                self.notifier.notify_entry(
                    entry.local_id,
                    &entry.name,
                    Some(value.clone()),
                    NOTIFY_IMMEDIATE | NOTIFY_NEW,
                    Some(uid),
                );
            }
        }
    }

    // -
    // Persistence

    /// Save persistent entries atomically. A periodic save is skipped when
    /// nothing changed and re-armed when it fails.
    pub fn save_persistent(
        &self,
        path: &Path,
        periodic: bool,
    ) -> Result<()> {
        let entries = {
            let mut state = self.state.lock();
            if periodic && !state.persistent_dirty {
                return Ok(());
            }
            state.persistent_dirty = false;
            state.collect(Entry::is_persistent)
        };

        if let Err(e) = persistence::save_atomic(path, &entries) {
            if periodic {
                self.state.lock().persistent_dirty = true;
                PERSIST_SAVE_FAILURES.inc();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Load a persistent file; every loaded entry is flagged persistent.
    pub fn load_persistent(
        &self,
        path: &Path,
        warn: &mut dyn FnMut(usize, &str),
    ) -> Result<()> {
        let entries = read_file(path, warn)?;
        self.apply_loaded(entries, true);
        Ok(())
    }

    /// Save every valued entry under `prefix`, persistent or not.
    pub fn save_entries(
        &self,
        path: &Path,
        prefix: &str,
    ) -> Result<()> {
        let entries = self.state.lock().collect(|e| e.name.starts_with(prefix));
        persistence::save_atomic(path, &entries)?;
        Ok(())
    }

    /// Load the entries under `prefix` from a file, leaving flags alone.
    pub fn load_entries(
        &self,
        path: &Path,
        prefix: &str,
        warn: &mut dyn FnMut(usize, &str),
    ) -> Result<()> {
        let mut entries = read_file(path, warn)?;
        entries.retain(|(name, _)| name.starts_with(prefix));
        self.apply_loaded(entries, false);
        Ok(())
    }

    fn apply_loaded(
        &self,
        entries: Vec<NamedValue>,
        persistent: bool,
    ) {
        let mut out = Vec::new();
        let dispatcher = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let has_dispatcher = state.has_dispatcher();
            let local_notifiers = self.notifier.local_notifiers();

            for (name, value) in entries {
                let idx = state.get_or_new(&name);
                if state.server && state.entries[idx].id == UNASSIGNED_ID {
                    state.assign_id(idx);
                }
                let entry = &mut state.entries[idx];
                let old = entry.replace_value(value.clone());
                let flags_changed = persistent && !entry.is_persistent();
                if flags_changed {
                    entry.flags |= ENTRY_PERSISTENT;
                }

                if local_notifiers {
                    let flags_bit = if flags_changed { NOTIFY_FLAGS } else { 0 };
                    let notify_flags = match &old {
                        None => Some(NOTIFY_NEW),
                        Some(old) if **old != *value => Some(NOTIFY_UPDATE | flags_bit),
                        Some(_) if flags_changed => Some(NOTIFY_FLAGS),
                        Some(_) => None,
                    };
                    if let Some(f) = notify_flags {
                        self.notifier
                            .notify_entry(idx, &name, Some(value.clone()), f | NOTIFY_LOCAL, None);
                    }
                }

                if !has_dispatcher {
                    continue;
                }
                entry.seq_num.increment();
                match &old {
                    Some(old) if old.value_type() == value.value_type() => {
                        if entry.id != UNASSIGNED_ID {
                            if **old != *value {
                                out.push(Outgoing::all(Message::entry_update(entry.id, entry.seq_num, value)));
                            }
                            if flags_changed {
                                out.push(Outgoing::all(Message::flags_update(entry.id, entry.flags)));
                            }
                        }
                    }
                    _ => out.push(Outgoing::all(Message::entry_assign(
                        name.clone(),
                        entry.id,
                        entry.seq_num,
                        value,
                        entry.flags,
                    ))),
                }
            }
            state.dispatcher()
        };
        Self::send(dispatcher, out);
    }

    #[cfg(test)]
    pub(crate) fn persistent_dirty(&self) -> bool {
        self.state.lock().persistent_dirty
    }

    #[cfg(test)]
    pub(crate) fn pending_rpc_calls(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    pub(crate) fn entry_wire_id(
        &self,
        name: &str,
    ) -> Option<u16> {
        let state = self.state.lock();
        state.lookup(name).map(|idx| state.entries[idx].id)
    }

    // -
    // RPC

    /// Turn an entry into an RPC served by listener `rpc_uid`. Not allowed
    /// on a networked client.
    pub fn create_rpc(
        &self,
        local_id: usize,
        def: Vec<u8>,
        rpc_uid: ListenerHandle,
    ) -> Result<()> {
        let mut out = Vec::new();
        let dispatcher = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.server && state.has_dispatcher() {
                return Err(EntryError::RpcRequiresServer.into());
            }
            if local_id >= state.entries.len() {
                return Err(EntryError::NotFound(local_id).into());
            }
            let value = Arc::new(Value::Rpc(def));
            let has_dispatcher = state.has_dispatcher();
            let needs_id = state.entries[local_id].id == UNASSIGNED_ID;

            let entry = &mut state.entries[local_id];
            entry.rpc_uid = Some(rpc_uid);
            let old = entry.replace_value(value.clone());
            if old.as_deref() == Some(&*value) {
                return Ok(());
            }
            if needs_id && state.server {
                state.assign_id(local_id);
            }
            let entry = &mut state.entries[local_id];
            entry.seq_num.increment();
            if has_dispatcher {
                let msg = match &old {
                    Some(old) if old.is_rpc() => Message::entry_update(entry.id, entry.seq_num, value),
                    _ => Message::entry_assign(entry.name.clone(), entry.id, entry.seq_num, value, entry.flags),
                };
                out.push(Outgoing::all(msg));
            }
            state.dispatcher()
        };
        Self::send(dispatcher, out);
        Ok(())
    }

    /// Start a call and return its call uid. On the server the call is
    /// answered locally; on a client it goes to the server.
    pub fn call_rpc(
        &self,
        local_id: usize,
        params: Vec<u8>,
    ) -> Result<u16> {
        let (id, call_uid, name, rpc_uid, server, dispatcher) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let server = state.server;
            let dispatcher = state.dispatcher();
            let Some(entry) = state.entries.get_mut(local_id) else {
                return Err(EntryError::NotFound(local_id).into());
            };
            if !entry.value.as_ref().is_some_and(|v| v.is_rpc()) {
                return Err(EntryError::NotRpc(entry.name.clone()).into());
            }
            entry.rpc_call_uid = entry.rpc_call_uid.wrapping_add(1);
            (
                entry.id,
                entry.rpc_call_uid,
                entry.name.clone(),
                entry.rpc_uid,
                server,
                dispatcher,
            )
        };
        if server {
            // no local responder, so nothing will ever fill a slot
            let Some(rpc_uid) = rpc_uid else {
                return Err(EntryError::NotRpc(name).into());
            };
            self.calls.register(local_id, call_uid);
            let calls = Arc::downgrade(&self.calls);
            self.rpc_server.process_rpc(
                local_id,
                call_uid,
                &name,
                params,
                ConnectionInfo {
                    remote_id: "Server".to_string(),
                    remote_ip: "localhost".to_string(),
                    remote_port: 0,
                    last_update: get_now_as_micros(),
                    protocol_version: PROTO_REV_3_0,
                },
                Box::new(move |result| {
                    if let Some(calls) = calls.upgrade() {
                        calls.complete(local_id, call_uid, result);
                    }
                }),
                rpc_uid,
            );
        } else {
            self.calls.register(local_id, call_uid);
            if let Some(dispatcher) = dispatcher {
                dispatcher.queue_outgoing(Message::execute_rpc(id, call_uid, params), None, None);
            }
        }
        Ok(call_uid)
    }

    /// Wait for the result of a call made with [`Storage::call_rpc`].
    pub fn get_rpc_result(
        &self,
        local_id: usize,
        call_uid: u16,
        timeout: Option<Duration>,
    ) -> RpcOutcome {
        self.calls.wait(local_id, call_uid, timeout)
    }

    pub fn cancel_rpc_result(
        &self,
        local_id: usize,
        call_uid: u16,
    ) {
        self.calls.cancel(local_id, call_uid);
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.calls.cancel_all();
    }
}

fn read_file(
    path: &Path,
    warn: &mut dyn FnMut(usize, &str),
) -> std::result::Result<Vec<NamedValue>, StorageError> {
    let file = File::open(path).map_err(|source| StorageError::PathError {
        path: path.to_path_buf(),
        message: "could not open file",
        source,
    })?;
    persistence::read_entries(BufReader::new(file), warn)
}
