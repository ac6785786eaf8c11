use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::NetConfig;
use crate::crypto::{ConnectionCipher, NullCipher};
use crate::handshake::LoginPayload;
use crate::transport::arq_receiver::{ArqReceiver, ArqReceiverStats};
use crate::transport::arq_sender::{ArqSender, ArqSenderStats, SendOutcome};
use crate::transport::packet::{DeliveryClass, Frame};
use crate::transport::sequence::SeqNum;

/// Process-local handle for one remote. Ids are assigned by the server and never reused
///  within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// client side: CONNECT sent, waiting for the login response
    Connecting,
    /// server side: CONNECT received, waiting for the login message
    AwaitingLogin,
    /// server side: login received, waiting for the authority key fetch to settle
    LoginDeferred(LoginPayload),
    Connected {
        player_name: String,
        user_id: u64,
    },
}

/// Cumulative per-connection counters, cheap enough to keep unconditionally.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionStats {
    pub reliable_sender: ArqSenderStats,
    pub reliable_receiver: ArqReceiverStats,
    pub unreliable_packets_sent: u64,
    pub unreliable_packets_received: u64,
}

/// An application message that came out of a channel in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub wire_id: u8,
    pub body: Bytes,
}

/// Transport state for one remote: the per-class ARQ channels, the session cipher and
///  keepalive bookkeeping. Handshake progression and message dispatch live in the
///  manager; this type only moves bytes.
///
/// Encryption covers channel payloads, not frame headers. On the reliable channel,
///  decryption happens after in-order delivery, so the cipher installed by the login
///  response applies to everything sequenced behind it.
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub state: ConnectionState,

    reliable_sender: ArqSender,
    reliable_receiver: ArqReceiver,
    unreliable_seq: SeqNum,
    unreliable_packets_sent: u64,
    unreliable_packets_received: u64,

    cipher: Box<dyn ConnectionCipher>,

    pub last_heard: Instant,
    pub last_ping_sent: Instant,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        state: ConnectionState,
        config: &NetConfig,
        now: Instant,
    ) -> Connection {
        let channel_config = config.effective_channel_config(DeliveryClass::ReliableOrdered);
        Connection {
            id,
            addr,
            state,
            reliable_sender: ArqSender::new(
                DeliveryClass::ReliableOrdered,
                channel_config.window_size,
                channel_config.resend_delay,
            ),
            reliable_receiver: ArqReceiver::new(
                DeliveryClass::ReliableOrdered,
                channel_config.window_size,
            ),
            unreliable_seq: SeqNum::ZERO,
            unreliable_packets_sent: 0,
            unreliable_packets_received: 0,
            cipher: Box::new(NullCipher),
            last_heard: now,
            last_ping_sent: now,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn player_name(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Connected { player_name, .. } => Some(player_name),
            _ => None,
        }
    }

    /// Switches the connection to an encrypting cipher. Packets already stored for
    ///  retransmission keep their original (plaintext) bytes.
    pub fn install_cipher(&mut self, cipher: Box<dyn ConnectionCipher>) {
        debug!("installing session cipher on connection {}", self.id);
        self.cipher = cipher;
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_encrypting()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            reliable_sender: self.reliable_sender.stats(),
            reliable_receiver: self.reliable_receiver.stats(),
            unreliable_packets_sent: self.unreliable_packets_sent,
            unreliable_packets_received: self.unreliable_packets_received,
        }
    }

    /// Sends one framed message (`wire_id` byte followed by the message body) on the
    ///  given channel. Datagrams to put on the wire are appended to `out`.
    pub fn send_message(
        &mut self,
        wire_id: u8,
        body: &[u8],
        class: DeliveryClass,
        now: Instant,
        out: &mut Vec<Bytes>,
    ) -> SendOutcome {
        let mut message = BytesMut::with_capacity(1 + body.len());
        message.put_u8(wire_id);
        message.put_slice(body);
        let sealed = self.cipher.encrypt(&message);

        match class {
            DeliveryClass::ReliableOrdered => self.reliable_sender.enqueue(sealed, now, out),
            DeliveryClass::Unreliable => {
                let seq = self.unreliable_seq;
                self.unreliable_seq = self.unreliable_seq.next();
                self.unreliable_packets_sent += 1;
                out.push(
                    Frame::Data {
                        class: DeliveryClass::Unreliable,
                        seq,
                        payload: sealed,
                    }
                    .to_bytes(),
                );
                SendOutcome::Sent
            }
        }
    }

    /// Handles a DATA frame: acks, reorders and decrypts, appending response datagrams
    ///  to `out` and in-order application messages to `delivered`.
    pub fn on_data(
        &mut self,
        class: DeliveryClass,
        seq: SeqNum,
        payload: Bytes,
        out: &mut Vec<Bytes>,
        delivered: &mut Vec<DeliveredMessage>,
    ) {
        self.last_heard = Instant::now();

        let mut sealed_in_order = Vec::new();
        match class {
            DeliveryClass::ReliableOrdered => {
                let mut acks = Vec::new();
                self.reliable_receiver.on_packet(seq, payload, &mut acks, &mut sealed_in_order);
                for ack in acks {
                    out.push(Frame::Ack { class, seq: ack }.to_bytes());
                }
            }
            DeliveryClass::Unreliable => {
                self.unreliable_packets_received += 1;
                sealed_in_order.push(payload);
            }
        }

        for sealed in sealed_in_order {
            match self.cipher.decrypt(&sealed) {
                Ok(message) => {
                    if let Some(message) = split_message(message) {
                        delivered.push(message);
                    }
                    else {
                        warn!("empty message on connection {} - discarding", self.id);
                    }
                }
                Err(e) => {
                    warn!("undecryptable payload on connection {}: {:#} - discarding", self.id, e);
                }
            }
        }
    }

    pub fn on_ack(&mut self, class: DeliveryClass, seq: SeqNum, now: Instant, out: &mut Vec<Bytes>) {
        self.last_heard = Instant::now();
        match class {
            DeliveryClass::ReliableOrdered => self.reliable_sender.receive_ack(seq, now, out),
            DeliveryClass::Unreliable => {
                warn!("ack on the unreliable channel from connection {} - ignoring", self.id);
            }
        }
    }

    /// Periodic driver: retransmissions, window refills and keepalive pings.
    pub fn tick(&mut self, now: Instant, ping_interval: std::time::Duration, out: &mut Vec<Bytes>) {
        self.reliable_sender.tick(now, out);

        if self.is_connected() && now.duration_since(self.last_ping_sent) >= ping_interval {
            trace!("pinging connection {}", self.id);
            self.last_ping_sent = now;
            out.push(Frame::Ping.to_bytes());
        }
    }
}

fn split_message(mut message: Bytes) -> Option<DeliveredMessage> {
    if message.is_empty() {
        return None;
    }
    let wire_id = message.get_u8();
    Some(DeliveredMessage { wire_id, body: message })
}
