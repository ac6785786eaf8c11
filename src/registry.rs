use std::any::TypeId;

use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::connection::ConnectionId;

/// Wire ids 0..=7 are reserved for handshake messages; application message types get
///  ids assigned from here on up.
pub const FIRST_DYNAMIC_WIRE_ID: u8 = 8;

/// Which end of a connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Client,
    Server,
}

/// Which side(s) handle a given message type on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSide {
    Client,
    Server,
    Both,
}

impl HandlerSide {
    pub fn handles(&self, role: PeerRole) -> bool {
        match self {
            HandlerSide::Client => role == PeerRole::Client,
            HandlerSide::Server => role == PeerRole::Server,
            HandlerSide::Both => true,
        }
    }
}

/// An application message type that can travel over a connection. Implementations pair
///  `ser` with `try_deser` the same way the built-in frames do.
pub trait NetMessage: Send + 'static {
    fn ser(&self, buf: &mut BytesMut);

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self>
    where
        Self: Sized;
}

struct RegistryEntry {
    name: String,
    side: HandlerSide,
    wire_id: Option<u8>,
    decode_dispatch: Box<dyn Fn(ConnectionId, Bytes) -> anyhow::Result<()> + Send>,
}

/// Registry of application message types. Both sides register the same types (by name);
///  the server assigns wire ids at start, and clients adopt the server's mapping from
///  the registry sync message during the handshake.
pub struct MessageRegistry {
    entries: Vec<RegistryEntry>,
    by_type: FxHashMap<TypeId, usize>,
    by_wire_id: FxHashMap<u8, usize>,
    synced: bool,
}

impl MessageRegistry {
    pub fn new() -> MessageRegistry {
        MessageRegistry {
            entries: Vec::new(),
            by_type: FxHashMap::default(),
            by_wire_id: FxHashMap::default(),
            synced: false,
        }
    }

    /// Registers a message type under a (unique) name with the callback invoked when a
    ///  message of this type arrives on a side that handles it.
    pub fn register_message_type<T: NetMessage>(
        &mut self,
        name: &str,
        side: HandlerSide,
        callback: impl Fn(ConnectionId, T) + Send + 'static,
    ) -> anyhow::Result<()> {
        if self.entries.iter().any(|e| e.name == name) {
            bail!("message type name {:?} is already registered", name);
        }
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            bail!("message type {:?} is already registered", std::any::type_name::<T>());
        }

        let decode_dispatch = Box::new(move |connection_id: ConnectionId, payload: Bytes| {
            let mut payload = payload;
            let message = T::try_deser(&mut payload)?;
            callback(connection_id, message);
            Ok(())
        });

        self.by_type.insert(TypeId::of::<T>(), self.entries.len());
        self.entries.push(RegistryEntry {
            name: name.to_string(),
            side,
            wire_id: None,
            decode_dispatch,
        });
        Ok(())
    }

    /// Server side: assigns wire ids in registration order. Called once at server start.
    pub fn assign_wire_ids(&mut self) -> anyhow::Result<()> {
        if self.entries.len() > (u8::MAX - FIRST_DYNAMIC_WIRE_ID) as usize + 1 {
            bail!("too many registered message types: {}", self.entries.len());
        }
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let wire_id = FIRST_DYNAMIC_WIRE_ID + index as u8;
            entry.wire_id = Some(wire_id);
            self.by_wire_id.insert(wire_id, index);
        }
        self.synced = true;
        Ok(())
    }

    /// The name-to-id mapping a server sends to freshly connected clients.
    pub fn sync_entries(&self) -> Vec<(String, u8)> {
        self.entries
            .iter()
            .filter_map(|e| e.wire_id.map(|id| (e.name.clone(), id)))
            .collect()
    }

    /// Client side: adopts the server's mapping. Names the server knows but this client
    ///  does not are logged and skipped; messages with those ids become no-ops.
    pub fn apply_sync(&mut self, mapping: &[(String, u8)]) {
        self.by_wire_id.clear();
        for entry in self.entries.iter_mut() {
            entry.wire_id = None;
        }
        for (name, wire_id) in mapping {
            match self.entries.iter().position(|e| &e.name == name) {
                Some(index) => {
                    self.entries[index].wire_id = Some(*wire_id);
                    self.by_wire_id.insert(*wire_id, index);
                }
                None => warn!("server registered unknown message type {:?}", name),
            }
        }
        self.synced = true;
    }

    /// True once wire ids are established (server start resp. registry sync received).
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn wire_id_of<T: NetMessage>(&self) -> Option<u8> {
        self.wire_id_by_type(TypeId::of::<T>())
    }

    pub fn wire_id_by_type(&self, type_id: TypeId) -> Option<u8> {
        self.by_type
            .get(&type_id)
            .and_then(|&index| self.entries[index].wire_id)
    }

    pub fn is_registered(&self, type_id: TypeId) -> bool {
        self.by_type.contains_key(&type_id)
    }

    pub fn handler_side_by_type(&self, type_id: TypeId) -> Option<HandlerSide> {
        self.by_type.get(&type_id).map(|&index| self.entries[index].side)
    }

    /// Decodes and dispatches a received application message. An unmapped wire id is a
    ///  harmless no-op (types can exist on one side only); a decode failure is an error
    ///  so the caller can discard the rest of the datagram.
    pub fn dispatch(
        &self,
        role: PeerRole,
        connection_id: ConnectionId,
        wire_id: u8,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        let entry = match self.by_wire_id.get(&wire_id) {
            Some(&index) => &self.entries[index],
            None => {
                debug!("ignoring message with unmapped wire id {}", wire_id);
                return Ok(());
            }
        };
        if !entry.side.handles(role) {
            warn!(
                "ignoring message {:?} not handled on the {:?} side",
                entry.name, role
            );
            return Ok(());
        }
        (entry.decode_dispatch)(connection_id, payload)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        MessageRegistry::new()
    }
}
