//! A reliable message transport and session layer for game networking, built on top of
//!  plain UDP.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving typed *messages* (defined-length chunks of data),
//!   not byte streams
//! * Selective-repeat ARQ: a single lost packet never head-of-line-blocks packets that were
//!   already delivered; only individually lost packets are retransmitted
//! * Memory for in-flight data is bounded by a sliding acknowledgment window of fixed width,
//!   regardless of traffic volume - stored slots and ack bits are dense rings, so the hot
//!   path does not allocate per packet
//! * Retransmission is adaptive: a periodic resend timer is the safety net, while detected
//!   ack gaps trigger fast retransmit well below that timer
//! * Sessions are established through an authenticated (optionally encrypted) handshake that
//!   never blocks the simulation loop - all continuations are driven by the per-tick pump
//! * Message types are identified by a small wire id that is synchronized per connection:
//!   the server pushes its registry table right after the handshake, and typed callbacks are
//!   routed through statically registered factories
//!
//! Explicitly out of scope: congestion control beyond the fixed window, NAT traversal,
//!  multi-path routing, and prioritization beyond the delivery-class tags.
//!
//! ## Wire format
//!
//! Every UDP datagram starts with a packet kind byte; all numbers are in network byte
//!  order (BE):
//!
//! ```ascii
//! 0: packet kind (u8):
//!    0 CONNECT    - control: followed by the protocol version (u8)
//!    1 DISCONNECT - control: followed by a reason string (varint len + utf8)
//!    2 PING       - control: no payload
//!    3 PONG       - control: no payload
//!    4 DATA       - delivery class (u8), sequence number (u16), then the payload
//!    5 ACK        - delivery class (u8), acknowledged sequence number (u16)
//! ```
//!
//! The DATA payload is the application payload, encrypted iff a cipher was installed during
//!  the handshake (12-byte nonce followed by AES-256-GCM ciphertext and tag). Its first
//!  plaintext byte is the message-type wire id resolved through the synchronized registry;
//!  ids 0-7 are reserved for session-internal messages (login, login response, registry
//!  sync).
//!
//! Sequence numbers live in a fixed modulus space (1024); all comparisons use signed
//!  circular distance, so the window can wrap indefinitely.

pub mod auth;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod events;
pub mod handshake;
pub mod manager;
pub mod peer;
pub mod registry;
pub mod transport;
pub mod wire;
