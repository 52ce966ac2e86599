use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::UNASSIGNED_ID;
use crate::proto::Message;
use crate::proto::MessageType;

/// Per-connection batch of not yet posted messages.
///
/// Entry messages coalesce so a burst of writes to one entry within a
/// dispatch tick costs one message on the wire:
/// - assign/update for an id replaces the pending one; an update landing
///   on a pending assign rewrites the assign's sequence number and value
/// - flags updates coalesce per id
/// - a delete cancels the id's pending value and flags messages
/// - clear-all cancels every pending entry message
///
/// Messages for unassigned ids are never coalesced.
#[derive(Debug, Default)]
pub(crate) struct PendingOutgoing {
    msgs: Vec<Option<Arc<Message>>>,
    /// id -> (index of value message, index of flags message)
    slots: HashMap<u16, (Option<usize>, Option<usize>)>,
}

impl PendingOutgoing {
    pub(crate) fn is_empty(&self) -> bool {
        self.msgs.iter().all(Option::is_none)
    }

    pub(crate) fn push(
        &mut self,
        msg: Arc<Message>,
    ) {
        let id = msg.entry_id().unwrap_or(UNASSIGNED_ID);
        match msg.message_type() {
            MessageType::EntryAssign | MessageType::EntryUpdate if id != UNASSIGNED_ID => {
                match self.slots.get(&id).and_then(|s| s.0) {
                    Some(pos) => {
                        let merged = match (self.msgs[pos].as_deref(), &*msg) {
                            (
                                Some(Message::EntryAssign { name, flags, .. }),
                                Message::EntryUpdate { seq_num, value, .. },
                            ) => Some(Message::entry_assign(
                                name.clone(),
                                id,
                                *seq_num,
                                value.clone(),
                                *flags,
                            )),
                            _ => None,
                        };
                        self.msgs[pos] = Some(merged.unwrap_or(msg));
                    }
                    None => {
                        self.msgs.push(Some(msg));
                        self.slots.entry(id).or_default().0 = Some(self.msgs.len() - 1);
                    }
                }
            }
            MessageType::FlagsUpdate if id != UNASSIGNED_ID => {
                match self.slots.get(&id).and_then(|s| s.1) {
                    Some(pos) => self.msgs[pos] = Some(msg),
                    None => {
                        self.msgs.push(Some(msg));
                        self.slots.entry(id).or_default().1 = Some(self.msgs.len() - 1);
                    }
                }
            }
            MessageType::EntryDelete => {
                if id != UNASSIGNED_ID {
                    if let Some((value_pos, flags_pos)) = self.slots.remove(&id) {
                        for pos in [value_pos, flags_pos].into_iter().flatten() {
                            self.msgs[pos] = None;
                        }
                    }
                }
                self.msgs.push(Some(msg));
            }
            MessageType::ClearEntries => {
                for slot in self.msgs.iter_mut() {
                    let is_entry_msg = slot.as_ref().is_some_and(|m| {
                        matches!(
                            m.message_type(),
                            MessageType::EntryAssign
                                | MessageType::EntryUpdate
                                | MessageType::FlagsUpdate
                                | MessageType::EntryDelete
                                | MessageType::ClearEntries
                        )
                    });
                    if is_entry_msg {
                        *slot = None;
                    }
                }
                self.slots.clear();
                self.msgs.push(Some(msg));
            }
            _ => self.msgs.push(Some(msg)),
        }
    }

    /// Take the batch in queue order, leaving the queue empty.
    pub(crate) fn take(&mut self) -> Vec<Arc<Message>> {
        self.slots.clear();
        std::mem::take(&mut self.msgs).into_iter().flatten().collect()
    }
}
