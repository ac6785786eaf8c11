use std::any::TypeId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use crate::auth::authority::{spawn_key_fetch, AuthorityKeyState, HttpKeySource, KeySource};
use crate::auth::token::{unix_now, AuthToken};
use crate::config::{AuthMode, NetConfig};
use crate::connection::{
    Connection, ConnectionId, ConnectionState, ConnectionStats, DeliveredMessage,
};
use crate::crypto::{
    generate_server_keypair, generate_session_key, wrap_session_key, Aes256GcmCipher,
};
use crate::events::{ConnectionEvent, EventNotifier};
use crate::handshake::{
    disambiguate_name, process_login, LoginDecision, LoginPayload, LoginResponse, RegistrySync,
    SessionKeyOffer, LOGIN_RESPONSE_WIRE_ID, LOGIN_WIRE_ID, REGISTRY_SYNC_WIRE_ID,
};
use crate::peer::{Peer, SendSocket};
use crate::registry::{HandlerSide, MessageRegistry, NetMessage, PeerRole, FIRST_DYNAMIC_WIRE_ID};
use crate::transport::packet::{DeliveryClass, Frame};
use crate::transport::next_datagram::{AwaitOutcome, NextDatagramSlots};

/// While a client-side connection is in the CONNECT phase, the CONNECT packet is repeated
///  at this interval (the login message itself rides on the reliable channel and needs no
///  extra care).
const CONNECT_RESEND_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An established connection with no inbound traffic for this many ping intervals is
///  considered dead.
const IDLE_TIMEOUT_FACTOR: u32 = 5;

struct ManagedConnection {
    conn: Connection,
    /// index into `peers` of the socket serving this remote
    peer_index: usize,
    last_connect_resend: Instant,
    connect_started: Instant,
}

/// The single orchestrator of a networking endpoint, server or client. All state changes
///  happen either in one of the `async` lifecycle calls or inside [NetManager::pump],
///  which the application is expected to call from its frame loop.
pub struct NetManager {
    config: NetConfig,
    registry: MessageRegistry,

    role: Option<PeerRole>,
    shut_down: bool,

    peers: Vec<Peer>,
    connections: FxHashMap<SocketAddr, ManagedConnection>,
    by_id: FxHashMap<ConnectionId, SocketAddr>,
    next_connection_id: u64,

    authority: Option<watch::Receiver<AuthorityKeyState>>,
    client_session_key: Option<[u8; 32]>,
    client_server_addr: Option<SocketAddr>,
    /// client-side messages sent before the registry sync arrived
    pre_sync_queue: Vec<(TypeId, DeliveryClass, Bytes)>,

    next_message_slots: NextDatagramSlots<ConnectionId>,
    events: EventNotifier,
}

impl NetManager {
    pub fn new(config: NetConfig) -> anyhow::Result<NetManager> {
        config.validate()?;
        Ok(NetManager {
            config,
            registry: MessageRegistry::new(),
            role: None,
            shut_down: false,
            peers: Vec::new(),
            connections: FxHashMap::default(),
            by_id: FxHashMap::default(),
            next_connection_id: 1,
            authority: None,
            client_session_key: None,
            client_server_addr: None,
            pre_sync_queue: Vec::new(),
            next_message_slots: NextDatagramSlots::new(),
            events: EventNotifier::new(),
        })
    }

    /// Registers an application message type. Must happen before the endpoint is started
    ///  so both sides can agree on the id mapping.
    pub fn register_message_type<T: NetMessage>(
        &mut self,
        name: &str,
        side: HandlerSide,
        callback: impl Fn(ConnectionId, T) + Send + 'static,
    ) -> anyhow::Result<()> {
        if self.role.is_some() {
            bail!("message types must be registered before the endpoint is started");
        }
        self.registry.register_message_type(name, side, callback)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    /// The locally bound socket addresses, available once the endpoint is started.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|p| p.local_addr()).collect()
    }

    pub fn connected_players(&self) -> Vec<(ConnectionId, String)> {
        let mut players: Vec<(ConnectionId, String)> = self
            .connections
            .values()
            .filter_map(|m| m.conn.player_name().map(|n| (m.conn.id, n.to_string())))
            .collect();
        players.sort();
        players
    }

    /// Cumulative transport counters for one connection.
    pub fn stats(&self, connection_id: ConnectionId) -> anyhow::Result<ConnectionStats> {
        let addr = match self.by_id.get(&connection_id) {
            Some(addr) => addr,
            None => bail!("no connection {}", connection_id),
        };
        match self.connections.get(addr) {
            Some(managed) => Ok(managed.conn.stats()),
            None => bail!("no connection {}", connection_id),
        }
    }

    /// Binds the configured sockets and makes this endpoint a server: wire ids are
    ///  assigned, and the authority key fetch is kicked off if auth is enabled.
    pub async fn start_server(&mut self) -> anyhow::Result<()> {
        if self.config.auth_mode != AuthMode::Disabled {
            let url = match &self.config.auth_authority_url {
                Some(url) => url.clone(),
                None => bail!("auth is enabled but no authority url is configured"),
            };
            return self.start_server_with_key_source(HttpKeySource::new(url)).await;
        }
        self.start_server_inner(None).await
    }

    /// Like [NetManager::start_server], with the authority key lookup supplied by the
    ///  caller instead of the configured HTTP endpoint.
    pub async fn start_server_with_key_source(
        &mut self,
        key_source: impl KeySource,
    ) -> anyhow::Result<()> {
        self.start_server_inner(Some(spawn_key_fetch(key_source))).await
    }

    async fn start_server_inner(
        &mut self,
        authority: Option<watch::Receiver<AuthorityKeyState>>,
    ) -> anyhow::Result<()> {
        self.ensure_startable()?;

        if self.config.server_secret_key.is_none() {
            let (secret, public) = generate_server_keypair();
            debug!("no server key configured, generated a fresh x25519 key pair");
            self.config.server_secret_key = Some(secret);
            self.config.server_public_key = Some(public);
        }
        self.registry.assign_wire_ids()?;

        for addr in self.config.bind_addrs.clone() {
            self.peers.push(Peer::bind(addr).await?);
        }
        self.authority = authority;
        self.role = Some(PeerRole::Server);
        debug!("server started on {:?}", self.local_addrs());
        Ok(())
    }

    /// Binds a local socket and starts the handshake towards `server_addr`. Completion
    ///  (or failure) is reported through the event stream while the application pumps.
    pub async fn connect(
        &mut self,
        server_addr: SocketAddr,
        player_name: &str,
        token: Option<AuthToken>,
    ) -> anyhow::Result<()> {
        self.ensure_startable()?;

        let peer = Peer::bind(self.config.bind_addrs[0]).await?;
        self.role = Some(PeerRole::Client);

        let now = Instant::now();
        let mut conn = Connection::new(
            ConnectionId(0),
            server_addr,
            ConnectionState::Connecting,
            &self.config,
            now,
        );

        let mut out = vec![Frame::Connect { protocol_version: self.config.protocol_version }.to_bytes()];

        let session_key_offer = if self.config.encryption {
            let server_public = match self.config.server_public_key {
                Some(key) => key,
                None => bail!("encryption requires the server's public key"),
            };
            let session_key = generate_session_key();
            let (ephemeral_public, wrapped_key) = wrap_session_key(&server_public, &session_key);
            self.client_session_key = Some(session_key);
            Some(SessionKeyOffer { ephemeral_public, wrapped_key })
        }
        else {
            None
        };

        let login = LoginPayload {
            requested_name: player_name.to_string(),
            token,
            session_key_offer,
        };
        let mut body = BytesMut::new();
        login.ser(&mut body);
        conn.send_message(LOGIN_WIRE_ID, &body, DeliveryClass::ReliableOrdered, now, &mut out);

        send_all(&peer.send_socket(), server_addr, &out);
        self.peers.push(peer);
        self.client_server_addr = Some(server_addr);
        self.connections.insert(
            server_addr,
            ManagedConnection {
                conn,
                peer_index: 0,
                last_connect_resend: now,
                connect_started: now,
            },
        );
        debug!("connecting to {} as {:?}", server_addr, player_name);
        self.events.publish(ConnectionEvent::Connecting { addr: server_addr });
        Ok(())
    }

    fn ensure_startable(&self) -> anyhow::Result<()> {
        if self.shut_down {
            bail!("the endpoint is shut down");
        }
        if self.role.is_some() {
            bail!("the endpoint is already started");
        }
        Ok(())
    }

    /// Tears the endpoint down: every remote gets a DISCONNECT, every pending await
    ///  fails, and the sockets are released. The manager cannot be restarted.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        debug!("shutting down");

        let goodbye = Frame::Disconnect { reason: "shutting down".to_string() }.to_bytes();
        for (addr, managed) in self.connections.drain() {
            if let Some(peer) = self.peers.get(managed.peer_index) {
                send_all(&peer.send_socket(), addr, std::slice::from_ref(&goodbye));
            }
            if managed.conn.is_connected() {
                self.events.publish(ConnectionEvent::Disconnected {
                    connection_id: managed.conn.id,
                    reason: "shutting down".to_string(),
                });
            }
        }
        self.by_id.clear();
        self.next_message_slots.fail_all("shutting down");
        self.peers.clear();
        self.shut_down = true;
    }

    // ---- sending --------------------------------------------------------------------

    /// Server side: sends a message to one connected remote.
    pub fn send<T: NetMessage>(
        &mut self,
        to: ConnectionId,
        message: &T,
        class: DeliveryClass,
    ) -> anyhow::Result<()> {
        let body = self.encode_for_send(message)?;
        let addr = match self.by_id.get(&to) {
            Some(addr) => *addr,
            None => bail!("no connection {}", to),
        };
        let wire_id = match self.registry.wire_id_by_type(TypeId::of::<T>()) {
            Some(wire_id) => wire_id,
            None => bail!("message type {:?} has no wire id", std::any::type_name::<T>()),
        };
        self.send_raw(addr, wire_id, &body, class);
        Ok(())
    }

    /// Server side: sends a message to every connected remote.
    pub fn broadcast<T: NetMessage>(
        &mut self,
        message: &T,
        class: DeliveryClass,
    ) -> anyhow::Result<()> {
        if self.role != Some(PeerRole::Server) {
            bail!("broadcast is only valid on a server endpoint");
        }
        let body = self.encode_for_send(message)?;
        let wire_id = match self.registry.wire_id_by_type(TypeId::of::<T>()) {
            Some(wire_id) => wire_id,
            None => bail!("message type {:?} has no wire id", std::any::type_name::<T>()),
        };
        let targets: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, m)| m.conn.is_connected())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in targets {
            self.send_raw(addr, wire_id, &body, class);
        }
        Ok(())
    }

    /// Client side: sends a message to the server. Messages sent before the registry
    ///  sync arrived are queued and flushed (in order) once it does.
    pub fn send_to_server<T: NetMessage>(
        &mut self,
        message: &T,
        class: DeliveryClass,
    ) -> anyhow::Result<()> {
        if self.role != Some(PeerRole::Client) {
            bail!("send_to_server is only valid on a client endpoint");
        }
        let body = self.encode_for_send(message)?;
        let addr = match self.client_server_addr {
            Some(addr) => addr,
            None => bail!("not connected"),
        };

        if !self.registry.is_synced() {
            trace!("registry not synced yet, queueing outgoing message");
            self.pre_sync_queue.push((TypeId::of::<T>(), class, body));
            return Ok(());
        }
        let wire_id = match self.registry.wire_id_by_type(TypeId::of::<T>()) {
            Some(wire_id) => wire_id,
            None => bail!("message type {:?} has no wire id", std::any::type_name::<T>()),
        };
        self.send_raw(addr, wire_id, &body, class);
        Ok(())
    }

    fn encode_for_send<T: NetMessage>(&self, message: &T) -> anyhow::Result<Bytes> {
        if !self.registry.is_registered(TypeId::of::<T>()) {
            bail!("message type {:?} is not registered", std::any::type_name::<T>());
        }
        let local_role = match self.role {
            Some(role) => role,
            None => bail!("the endpoint is not started"),
        };
        let remote_role = match local_role {
            PeerRole::Client => PeerRole::Server,
            PeerRole::Server => PeerRole::Client,
        };
        if let Some(side) = self.registry.handler_side_by_type(TypeId::of::<T>()) {
            if !side.handles(remote_role) {
                bail!(
                    "message type {:?} is not handled on the {:?} side",
                    std::any::type_name::<T>(),
                    remote_role
                );
            }
        }

        let mut body = BytesMut::new();
        message.ser(&mut body);
        Ok(body.freeze())
    }

    fn send_raw(&mut self, addr: SocketAddr, wire_id: u8, body: &[u8], class: DeliveryClass) {
        let now = Instant::now();
        let mut out = Vec::new();
        let peer_index = match self.connections.get_mut(&addr) {
            Some(managed) => {
                managed
                    .conn
                    .send_message(wire_id, body, class, now, &mut out);
                managed.peer_index
            }
            None => {
                warn!("dropping send to unknown remote {}", addr);
                return;
            }
        };
        if let Some(peer) = self.peers.get(peer_index) {
            send_all(&peer.send_socket(), addr, &out);
        }
    }

    // ---- awaiting a single message --------------------------------------------------

    /// Arms the one next-message slot for a connection: the next application message
    ///  delivered on it resolves the slot. Fails while a previous await is outstanding.
    pub fn await_next_message(&mut self, connection_id: ConnectionId) -> anyhow::Result<()> {
        if !self.by_id.contains_key(&connection_id) {
            bail!("no connection {}", connection_id);
        }
        self.next_message_slots.arm(connection_id)
    }

    /// Polls an armed slot. Resolves with the raw message bytes (wire id byte followed
    ///  by the body), or with the disconnect reason if the connection died first.
    pub fn poll_next_message(&mut self, connection_id: ConnectionId) -> Option<AwaitOutcome> {
        self.next_message_slots.poll(connection_id)
    }

    pub fn cancel_next_message(&mut self, connection_id: ConnectionId) {
        self.next_message_slots.cancel(connection_id);
    }

    // ---- the pump -------------------------------------------------------------------

    /// Drives the endpoint: drains received datagrams, advances handshakes, retransmits,
    ///  pings, and times out dead connections. Call this once per frame.
    pub fn pump(&mut self, now: Instant) {
        if self.role.is_none() || self.shut_down {
            return;
        }

        let mut received: Vec<(usize, SocketAddr, Bytes)> = Vec::new();
        let mut batch = Vec::new();
        for (peer_index, peer) in self.peers.iter_mut().enumerate() {
            peer.drain(self.config.pump_batch_size, &mut batch);
            received.extend(batch.drain(..).map(|(from, datagram)| (peer_index, from, datagram)));
        }
        for (peer_index, from, datagram) in received {
            self.on_datagram(peer_index, from, datagram, now);
        }

        self.drive_deferred_logins(now);
        self.tick_connections(now);
    }

    fn on_datagram(&mut self, peer_index: usize, from: SocketAddr, datagram: Bytes, now: Instant) {
        let frame = match Frame::try_deser(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undecodable datagram from {}: {:#} - dropping", from, e);
                return;
            }
        };

        match frame {
            Frame::Connect { protocol_version } => {
                self.on_connect(peer_index, from, protocol_version, now)
            }
            Frame::Disconnect { reason } => self.on_disconnect(from, reason),
            Frame::Ping => {
                if let Some(managed) = self.connections.get_mut(&from) {
                    managed.conn.last_heard = Instant::now();
                    let pong = Frame::Pong.to_bytes();
                    if let Some(peer) = self.peers.get(managed.peer_index) {
                        send_all(&peer.send_socket(), from, std::slice::from_ref(&pong));
                    }
                }
            }
            Frame::Pong => {
                if let Some(managed) = self.connections.get_mut(&from) {
                    managed.conn.last_heard = Instant::now();
                }
            }
            Frame::Data { class, seq, payload } => {
                let (delivered, peer_index) = match self.connections.get_mut(&from) {
                    Some(managed) => {
                        let mut out = Vec::new();
                        let mut delivered = Vec::new();
                        managed.conn.on_data(class, seq, payload, &mut out, &mut delivered);
                        if let Some(peer) = self.peers.get(managed.peer_index) {
                            send_all(&peer.send_socket(), from, &out);
                        }
                        (delivered, managed.peer_index)
                    }
                    None => {
                        warn!("data from unknown remote {} - dropping", from);
                        return;
                    }
                };
                for message in delivered {
                    if !self.on_message(peer_index, from, message, now) {
                        // a poisoned message discards the rest of the datagram
                        break;
                    }
                }
            }
            Frame::Ack { class, seq } => {
                if let Some(managed) = self.connections.get_mut(&from) {
                    let mut out = Vec::new();
                    managed.conn.on_ack(class, seq, now, &mut out);
                    if let Some(peer) = self.peers.get(managed.peer_index) {
                        send_all(&peer.send_socket(), from, &out);
                    }
                }
                else {
                    trace!("ack from unknown remote {} - dropping", from);
                }
            }
        }
    }

    fn on_connect(&mut self, peer_index: usize, from: SocketAddr, protocol_version: u8, now: Instant) {
        if self.role != Some(PeerRole::Server) {
            warn!("CONNECT from {} on a client endpoint - ignoring", from);
            return;
        }
        if protocol_version != self.config.protocol_version {
            debug!(
                "rejecting {}: protocol version {} instead of {}",
                from, protocol_version, self.config.protocol_version
            );
            let reject = Frame::Disconnect { reason: "protocol version mismatch".to_string() }.to_bytes();
            if let Some(peer) = self.peers.get(peer_index) {
                send_all(&peer.send_socket(), from, std::slice::from_ref(&reject));
            }
            return;
        }
        if self.connections.contains_key(&from) {
            // connect retry while the first one is already being processed
            trace!("duplicate CONNECT from {} - ignoring", from);
            return;
        }

        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        debug!("CONNECT from {} - awaiting login as connection {}", from, id);
        self.connections.insert(
            from,
            ManagedConnection {
                conn: Connection::new(id, from, ConnectionState::AwaitingLogin, &self.config, now),
                peer_index,
                last_connect_resend: now,
                connect_started: now,
            },
        );
        self.events.publish(ConnectionEvent::Connecting { addr: from });
    }

    fn on_disconnect(&mut self, from: SocketAddr, reason: String) {
        let managed = match self.connections.remove(&from) {
            Some(managed) => managed,
            None => return,
        };
        self.by_id.remove(&managed.conn.id);
        self.next_message_slots.fail(managed.conn.id, &reason);

        match &managed.conn.state {
            ConnectionState::Connecting => {
                self.events.publish(ConnectionEvent::ConnectFailed { addr: from, reason });
            }
            ConnectionState::Connected { .. } => {
                self.events.publish(ConnectionEvent::Disconnected {
                    connection_id: managed.conn.id,
                    reason,
                });
            }
            _ => debug!("{} disconnected during the handshake: {}", from, reason),
        }
    }

    /// Handles one in-order application-level message. Returns false if the rest of the
    ///  datagram must be discarded.
    fn on_message(
        &mut self,
        peer_index: usize,
        from: SocketAddr,
        message: DeliveredMessage,
        now: Instant,
    ) -> bool {
        if message.wire_id >= FIRST_DYNAMIC_WIRE_ID {
            let connection_id = match self.connections.get(&from) {
                Some(managed) if managed.conn.is_connected() => managed.conn.id,
                _ => {
                    warn!("application message from {} before the handshake finished", from);
                    return false;
                }
            };

            let mut raw = BytesMut::with_capacity(1 + message.body.len());
            raw.put_u8(message.wire_id);
            raw.put_slice(&message.body);
            if self.next_message_slots.offer(connection_id, raw.freeze()) {
                // an armed await consumes the message instead of the dispatcher
                return true;
            }

            let role = match self.role {
                Some(role) => role,
                None => return false,
            };
            if let Err(e) = self.registry.dispatch(role, connection_id, message.wire_id, message.body) {
                warn!("failed to decode message from {}: {:#} - discarding datagram", from, e);
                return false;
            }
            return true;
        }

        match (self.role, message.wire_id) {
            (Some(PeerRole::Server), LOGIN_WIRE_ID) => {
                let mut body = message.body;
                match LoginPayload::try_deser(&mut body) {
                    Ok(login) => self.on_login(peer_index, from, login, now),
                    Err(e) => warn!("undecodable login from {}: {:#} - ignoring", from, e),
                }
            }
            (Some(PeerRole::Client), LOGIN_RESPONSE_WIRE_ID) => {
                let mut body = message.body;
                match LoginResponse::try_deser(&mut body) {
                    Ok(response) => self.on_login_response(from, response),
                    Err(e) => warn!("undecodable login response from {}: {:#} - ignoring", from, e),
                }
            }
            (Some(PeerRole::Client), REGISTRY_SYNC_WIRE_ID) => {
                let mut body = message.body;
                match RegistrySync::try_deser(&mut body) {
                    Ok(sync) => self.on_registry_sync(from, sync),
                    Err(e) => warn!("undecodable registry sync from {}: {:#} - ignoring", from, e),
                }
            }
            _ => warn!(
                "handshake message {} from {} is invalid for this endpoint - ignoring",
                message.wire_id, from
            ),
        }
        true
    }

    fn on_login(&mut self, peer_index: usize, from: SocketAddr, login: LoginPayload, now: Instant) {
        match self.connections.get(&from) {
            Some(managed) if matches!(managed.conn.state, ConnectionState::AwaitingLogin) => {}
            Some(_) => {
                trace!("stray login from {} - ignoring", from);
                return;
            }
            None => return,
        }

        let decision = process_login(&self.config, &self.authority_state(), from, &login, unix_now());
        self.apply_login_decision(peer_index, from, login, decision, now);
    }

    fn apply_login_decision(
        &mut self,
        peer_index: usize,
        from: SocketAddr,
        login: LoginPayload,
        decision: LoginDecision,
        now: Instant,
    ) {
        match decision {
            LoginDecision::Deferred => {
                debug!("deferring login from {} until the authority key settles", from);
                if let Some(managed) = self.connections.get_mut(&from) {
                    managed.conn.state = ConnectionState::LoginDeferred(login);
                }
            }
            LoginDecision::Reject { reason } => {
                debug!("rejecting login from {}: {}", from, reason);
                self.connections.remove(&from);
                let reject = Frame::Disconnect { reason }.to_bytes();
                if let Some(peer) = self.peers.get(peer_index) {
                    send_all(&peer.send_socket(), from, std::slice::from_ref(&reject));
                }
            }
            LoginDecision::Accept { user_id, session_key } => {
                self.admit(from, login.requested_name, user_id, session_key, now);
            }
        }
    }

    fn admit(
        &mut self,
        from: SocketAddr,
        requested_name: String,
        token_user_id: Option<u64>,
        session_key: Option<[u8; 32]>,
        now: Instant,
    ) {
        // anonymous logins still get an opaque session identity
        let user_id = token_user_id.unwrap_or_else(|| OsRng.next_u64());
        let taken: FxHashSet<String> = self
            .connections
            .values()
            .filter_map(|m| m.conn.player_name().map(str::to_string))
            .collect();
        let assigned_name = disambiguate_name(&requested_name, &taken);

        let (id, peer_index, out) = match self.connections.get_mut(&from) {
            Some(managed) => {
                let id = managed.conn.id;
                let response = LoginResponse {
                    connection_id: id,
                    assigned_name: assigned_name.clone(),
                    user_id,
                    encrypted: session_key.is_some(),
                };
                let mut body = BytesMut::new();
                response.ser(&mut body);

                let mut out = Vec::new();
                // the response is the last plaintext message; everything sequenced
                //  behind it is encrypted once a key was negotiated
                managed.conn.send_message(
                    LOGIN_RESPONSE_WIRE_ID,
                    &body,
                    DeliveryClass::ReliableOrdered,
                    now,
                    &mut out,
                );
                if let Some(key) = &session_key {
                    managed.conn.install_cipher(Box::new(Aes256GcmCipher::new(key)));
                }

                let sync = RegistrySync { entries: self.registry.sync_entries() };
                let mut sync_body = BytesMut::new();
                sync.ser(&mut sync_body);
                managed.conn.send_message(
                    REGISTRY_SYNC_WIRE_ID,
                    &sync_body,
                    DeliveryClass::ReliableOrdered,
                    now,
                    &mut out,
                );

                managed.conn.state = ConnectionState::Connected {
                    player_name: assigned_name.clone(),
                    user_id,
                };
                (id, managed.peer_index, out)
            }
            None => return,
        };

        if let Some(peer) = self.peers.get(peer_index) {
            send_all(&peer.send_socket(), from, &out);
        }

        self.by_id.insert(id, from);
        debug!("connection {} established for {:?} at {}", id, assigned_name, from);
        self.events.publish(ConnectionEvent::Connected {
            connection_id: id,
            addr: from,
            player_name: assigned_name,
            user_id,
        });
    }

    fn on_login_response(&mut self, from: SocketAddr, response: LoginResponse) {
        let managed = match self.connections.get_mut(&from) {
            Some(managed) if matches!(managed.conn.state, ConnectionState::Connecting) => managed,
            _ => {
                trace!("stray login response from {} - ignoring", from);
                return;
            }
        };

        managed.conn.id = response.connection_id;
        managed.conn.state = ConnectionState::Connected {
            player_name: response.assigned_name.clone(),
            user_id: response.user_id,
        };
        if response.encrypted {
            match self.client_session_key.take() {
                Some(key) => managed.conn.install_cipher(Box::new(Aes256GcmCipher::new(&key))),
                None => warn!("server reports encryption but no session key was offered"),
            }
        }
        self.by_id.insert(response.connection_id, from);
        debug!(
            "logged in as {:?} (connection {})",
            response.assigned_name, response.connection_id
        );
    }

    fn on_registry_sync(&mut self, from: SocketAddr, sync: RegistrySync) {
        let (id, player_name, user_id) = match self.connections.get(&from) {
            Some(managed) => match &managed.conn.state {
                ConnectionState::Connected { player_name, user_id } => {
                    (managed.conn.id, player_name.clone(), *user_id)
                }
                _ => {
                    warn!("registry sync from {} before the login response - ignoring", from);
                    return;
                }
            },
            None => return,
        };

        self.registry.apply_sync(&sync.entries);
        self.flush_pre_sync_queue();
        self.events.publish(ConnectionEvent::Connected {
            connection_id: id,
            addr: from,
            player_name,
            user_id,
        });
    }

    fn flush_pre_sync_queue(&mut self) {
        let queued = std::mem::take(&mut self.pre_sync_queue);
        let addr = match self.client_server_addr {
            Some(addr) => addr,
            None => return,
        };
        for (type_id, class, body) in queued {
            match self.registry.wire_id_by_type(type_id) {
                Some(wire_id) => self.send_raw(addr, wire_id, &body, class),
                None => warn!("dropping queued message: its type got no wire id from the server"),
            }
        }
    }

    fn authority_state(&self) -> AuthorityKeyState {
        match &self.authority {
            Some(receiver) => receiver.borrow().clone(),
            // no fetch was started, so nothing to wait for
            None => AuthorityKeyState::Failed("no authority configured".to_string()),
        }
    }

    fn drive_deferred_logins(&mut self, now: Instant) {
        if self.role != Some(PeerRole::Server) {
            return;
        }
        let authority = self.authority_state();
        if authority == AuthorityKeyState::Pending {
            return;
        }

        let deferred: Vec<(SocketAddr, usize, LoginPayload)> = self
            .connections
            .iter()
            .filter_map(|(addr, managed)| match &managed.conn.state {
                ConnectionState::LoginDeferred(login) => {
                    Some((*addr, managed.peer_index, login.clone()))
                }
                _ => None,
            })
            .collect();

        for (addr, peer_index, login) in deferred {
            let decision = process_login(&self.config, &authority, addr, &login, unix_now());
            // the key fetch settled, so the decision cannot defer again
            self.apply_login_decision(peer_index, addr, login, decision, now);
        }
    }

    #[cfg(test)]
    fn pre_sync_queued(&self) -> usize {
        self.pre_sync_queue.len()
    }

    fn tick_connections(&mut self, now: Instant) {
        let idle_timeout = self.config.ping_interval * IDLE_TIMEOUT_FACTOR;
        let mut timed_out: Vec<SocketAddr> = Vec::new();
        let mut connect_failed: Vec<SocketAddr> = Vec::new();

        for (addr, managed) in self.connections.iter_mut() {
            let mut out = Vec::new();
            managed.conn.tick(now, self.config.ping_interval, &mut out);

            if matches!(managed.conn.state, ConnectionState::Connecting) {
                if now.duration_since(managed.connect_started) > CONNECT_TIMEOUT {
                    connect_failed.push(*addr);
                    continue;
                }
                if now.duration_since(managed.last_connect_resend) >= CONNECT_RESEND_INTERVAL {
                    managed.last_connect_resend = now;
                    out.push(
                        Frame::Connect { protocol_version: self.config.protocol_version }.to_bytes(),
                    );
                }
            }
            else if managed.conn.is_connected()
                && now.duration_since(managed.conn.last_heard) > idle_timeout
            {
                timed_out.push(*addr);
                continue;
            }

            if let Some(peer) = self.peers.get(managed.peer_index) {
                send_all(&peer.send_socket(), *addr, &out);
            }
        }

        for addr in connect_failed {
            warn!("connect to {} timed out", addr);
            self.connections.remove(&addr);
            self.events.publish(ConnectionEvent::ConnectFailed {
                addr,
                reason: "connect timeout".to_string(),
            });
        }
        for addr in timed_out {
            if let Some(managed) = self.connections.remove(&addr) {
                warn!("connection {} at {} timed out", managed.conn.id, addr);
                self.by_id.remove(&managed.conn.id);
                self.next_message_slots.fail(managed.conn.id, "timeout");
                let goodbye = Frame::Disconnect { reason: "timeout".to_string() }.to_bytes();
                if let Some(peer) = self.peers.get(managed.peer_index) {
                    send_all(&peer.send_socket(), addr, std::slice::from_ref(&goodbye));
                }
                self.events.publish(ConnectionEvent::Disconnected {
                    connection_id: managed.conn.id,
                    reason: "timeout".to_string(),
                });
            }
        }
    }
}

fn send_all(socket: &impl SendSocket, to: SocketAddr, datagrams: &[Bytes]) {
    for datagram in datagrams {
        if let Err(e) = socket.send_datagram(datagram, to) {
            warn!("send to {} failed: {:#}", to, e);
        }
    }
}
