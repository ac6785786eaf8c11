use std::fmt::Debug;
use std::hash::Hash;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Outcome of an await-next-datagram slot.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AwaitOutcome {
    Datagram(Bytes),
    /// The connection went away while the slot was armed; carries the disconnect reason.
    Disconnected(String),
}

enum SlotState {
    Armed,
    Resolved(AwaitOutcome),
}

/// "Await the next raw datagram from this connection", as an explicit state machine
///  polled by the per-tick pump rather than a blocked thread. At most one slot may be
///  armed per key; a disconnect while armed resolves the slot with a disconnection
///  failure instead of letting it hang, and cancellation (e.g. on shutdown) just drops
///  the slot.
pub struct NextDatagramSlots<K> {
    slots: FxHashMap<K, SlotState>,
}

impl<K: Hash + Eq + Copy + Debug> NextDatagramSlots<K> {
    pub fn new() -> NextDatagramSlots<K> {
        NextDatagramSlots { slots: FxHashMap::default() }
    }

    /// Arms the slot for `key`. Arming while a slot is already outstanding is a
    ///  programmer error and fails loudly.
    pub fn arm(&mut self, key: K) -> anyhow::Result<()> {
        if self.slots.contains_key(&key) {
            bail!("an await-next-datagram slot is already outstanding for {:?}", key);
        }
        self.slots.insert(key, SlotState::Armed);
        Ok(())
    }

    pub fn is_armed(&self, key: K) -> bool {
        matches!(self.slots.get(&key), Some(SlotState::Armed))
    }

    /// Offers a received datagram. Returns true iff an armed slot consumed it (in which
    ///  case it must not be routed through the regular channels as well).
    pub fn offer(&mut self, key: K, datagram: Bytes) -> bool {
        match self.slots.get_mut(&key) {
            Some(state @ SlotState::Armed) => {
                trace!("await slot for {:?} resolved with a datagram", key);
                *state = SlotState::Resolved(AwaitOutcome::Datagram(datagram));
                true
            }
            _ => false,
        }
    }

    /// Resolves an armed slot with a disconnection failure.
    pub fn fail(&mut self, key: K, reason: &str) {
        if let Some(state @ SlotState::Armed) = self.slots.get_mut(&key) {
            trace!("await slot for {:?} failed: {}", key, reason);
            *state = SlotState::Resolved(AwaitOutcome::Disconnected(reason.to_string()));
        }
    }

    pub fn fail_all(&mut self, reason: &str) {
        for state in self.slots.values_mut() {
            if matches!(state, SlotState::Armed) {
                *state = SlotState::Resolved(AwaitOutcome::Disconnected(reason.to_string()));
            }
        }
    }

    /// Polls the slot, consuming it when it resolved. An armed slot stays armed.
    pub fn poll(&mut self, key: K) -> Option<AwaitOutcome> {
        match self.slots.get(&key) {
            Some(SlotState::Resolved(_)) => match self.slots.remove(&key) {
                Some(SlotState::Resolved(outcome)) => Some(outcome),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn cancel(&mut self, key: K) {
        self.slots.remove(&key);
    }
}
