use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::transport::packet::DeliveryClass;
use crate::transport::sequence::SEQ_MODULUS;

/// How logins are validated on the server side.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuthMode {
    /// Logins carry a requested display name; tokens are ignored.
    Disabled,
    /// Tokens are validated when present, name-only logins are still accepted.
    Optional,
    /// Logins without a valid token are rejected (unless loopback-exempt).
    Required,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum number of in-flight, unacknowledged packets stored on the sender side.
    ///  Must not exceed the sequence modulus.
    pub window_size: u16,

    /// Base delay after which an unacknowledged packet is retransmitted by the periodic
    ///  resend scan. Fast retransmit on detected ack gaps fires earlier, bounded by
    ///  0.35 times this delay.
    pub resend_delay: Duration,
}

/// Top-level configuration consumed by [`crate::manager::NetManager`].
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Server: one peer socket is bound per address. Client: the single address to bind
    ///  the local socket to (use port 0 for an ephemeral port).
    pub bind_addrs: Vec<SocketAddr>,

    pub default_channel_config: ChannelConfig,
    pub specific_channel_configs: FxHashMap<DeliveryClass, ChannelConfig>,

    pub auth_mode: AuthMode,
    /// Where the authority's ed25519 verifying key (32 raw bytes) is fetched from, once,
    ///  at server startup. Must be set when `auth_mode` is not `Disabled`.
    pub auth_authority_url: Option<String>,
    /// Loopback peers may log in without a token even when auth is `Required`.
    pub loopback_auth_bypass: bool,

    /// Client: offer a session key during login. Server: accept only logins that offer
    ///  one. A server with this flag unset still accepts and uses offered keys.
    pub encryption: bool,
    /// The server's static x25519 secret (server side). Generated if absent.
    pub server_secret_key: Option<[u8; 32]>,
    /// The server's known x25519 public key (client side). Required to offer encryption.
    pub server_public_key: Option<[u8; 32]>,

    /// Upper bound of datagrams drained from a peer socket per pump call.
    pub pump_batch_size: usize,
    /// Interval for keepalive pings on established connections.
    pub ping_interval: Duration,
    /// Wire protocol version sent in CONNECT packets.
    pub protocol_version: u8,
}

impl NetConfig {
    pub fn new(bind_addr: SocketAddr) -> NetConfig {
        NetConfig {
            bind_addrs: vec![bind_addr],
            default_channel_config: ChannelConfig {
                window_size: 256,
                resend_delay: Duration::from_millis(250),
            },
            specific_channel_configs: FxHashMap::default(),
            auth_mode: AuthMode::Disabled,
            auth_authority_url: None,
            loopback_auth_bypass: true,
            encryption: false,
            server_secret_key: None,
            server_public_key: None,
            pump_batch_size: 256,
            ping_interval: Duration::from_secs(2),
            protocol_version: crate::transport::packet::PROTOCOL_VERSION,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addrs.is_empty() {
            bail!("at least one bind address is required");
        }
        for class in [DeliveryClass::Unreliable, DeliveryClass::ReliableOrdered] {
            let channel = self.effective_channel_config(class);
            if channel.window_size == 0 {
                bail!("window size for {:?} must be positive", class);
            }
            if channel.window_size > SEQ_MODULUS {
                bail!(
                    "window size {} for {:?} exceeds the sequence modulus {}",
                    channel.window_size,
                    class,
                    SEQ_MODULUS
                );
            }
            if channel.resend_delay.is_zero() {
                bail!("resend delay for {:?} must be positive", class);
            }
        }
        if self.auth_mode != AuthMode::Disabled && self.auth_authority_url.is_none() {
            bail!("auth mode {:?} requires an authority url", self.auth_mode);
        }
        if self.encryption && self.server_public_key.is_none() {
            bail!("offering encryption requires the server's public key");
        }
        if self.pump_batch_size == 0 {
            bail!("pump batch size must be positive");
        }
        Ok(())
    }

    pub fn effective_channel_config(&self, class: DeliveryClass) -> &ChannelConfig {
        self.specific_channel_configs
            .get(&class)
            .unwrap_or(&self.default_channel_config)
    }
}
