use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::auth::authority::AuthorityKeyState;
use crate::auth::token::AuthToken;
use crate::config::{AuthMode, NetConfig};
use crate::connection::ConnectionId;
use crate::crypto::{unwrap_session_key, SESSION_KEY_LEN, WRAPPED_KEY_LEN};
use crate::wire::{put_string, try_get_array, try_get_string};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub const LOGIN_WIRE_ID: u8 = 0;
pub const LOGIN_RESPONSE_WIRE_ID: u8 = 1;
pub const REGISTRY_SYNC_WIRE_ID: u8 = 2;

pub const REASON_AUTH_REQUIRED: &str = "authentication required";
pub const REASON_AUTH_UNAVAILABLE: &str = "authentication unavailable";
pub const REASON_INVALID_TOKEN: &str = "invalid token";
pub const REASON_EXPIRED_TOKEN: &str = "expired token";
pub const REASON_INVALID_SESSION_KEY: &str = "invalid session key";
pub const REASON_ENCRYPTION_REQUIRED: &str = "encryption required";

const FLAG_HAS_TOKEN: u8 = 0x01;
const FLAG_HAS_KEY_OFFER: u8 = 0x02;
const FLAG_ENCRYPTED: u8 = 0x01;

/// First message a client sends on the reliable ordered channel after the connect
///  exchange. Carries the requested player name, optionally an auth token, and
///  optionally a session key offer wrapped under the server's public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPayload {
    pub requested_name: String,
    pub token: Option<AuthToken>,
    pub session_key_offer: Option<SessionKeyOffer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyOffer {
    pub ephemeral_public: [u8; 32],
    pub wrapped_key: [u8; WRAPPED_KEY_LEN],
}

impl LoginPayload {
    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.token.is_some() {
            flags |= FLAG_HAS_TOKEN;
        }
        if self.session_key_offer.is_some() {
            flags |= FLAG_HAS_KEY_OFFER;
        }
        buf.put_u8(flags);
        put_string(buf, &self.requested_name);
        if let Some(token) = &self.token {
            token.ser(buf);
        }
        if let Some(offer) = &self.session_key_offer {
            buf.put_slice(&offer.ephemeral_public);
            buf.put_slice(&offer.wrapped_key);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<LoginPayload> {
        if buf.remaining() < 1 {
            bail!("login payload truncated");
        }
        let flags = buf.get_u8();
        let requested_name = try_get_string(buf)?;
        let token = if flags & FLAG_HAS_TOKEN != 0 {
            Some(AuthToken::try_deser(buf)?)
        } else {
            None
        };
        let session_key_offer = if flags & FLAG_HAS_KEY_OFFER != 0 {
            Some(SessionKeyOffer {
                ephemeral_public: try_get_array::<32>(buf)?,
                wrapped_key: try_get_array::<WRAPPED_KEY_LEN>(buf)?,
            })
        } else {
            None
        };
        Ok(LoginPayload {
            requested_name,
            token,
            session_key_offer,
        })
    }
}

/// The server's answer to a successful login. This is the last packet on the connection
///  that is never encrypted: once it is on the wire, both sides install the session
///  cipher (if one was negotiated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub connection_id: ConnectionId,
    pub assigned_name: String,
    /// opaque session identity: the token's user id, or a random one for anonymous logins
    pub user_id: u64,
    pub encrypted: bool,
}

impl LoginResponse {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.connection_id.0);
        put_string(buf, &self.assigned_name);
        let mut flags = 0u8;
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        buf.put_u8(flags);
        buf.put_u64(self.user_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<LoginResponse> {
        if buf.remaining() < 9 {
            bail!("login response truncated");
        }
        let connection_id = ConnectionId(buf.get_u64());
        let assigned_name = try_get_string(buf)?;
        if buf.remaining() < 9 {
            bail!("login response truncated");
        }
        let flags = buf.get_u8();
        let user_id = buf.get_u64();
        Ok(LoginResponse {
            connection_id,
            assigned_name,
            user_id,
            encrypted: flags & FLAG_ENCRYPTED != 0,
        })
    }
}

/// Name-to-wire-id table the server sends right after the login response so the client
///  can start decoding application messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySync {
    pub entries: Vec<(String, u8)>,
}

impl RegistrySync {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.entries.len());
        for (name, wire_id) in &self.entries {
            put_string(buf, name);
            buf.put_u8(*wire_id);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RegistrySync> {
        let count = buf.try_get_usize_varint()?;
        if count > u8::MAX as usize {
            bail!("registry sync with implausible entry count {}", count);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name = try_get_string(buf)?;
            if buf.remaining() < 1 {
                bail!("registry sync truncated");
            }
            entries.push((name, buf.get_u8()));
        }
        Ok(RegistrySync { entries })
    }
}

/// Outcome of evaluating a login against the server's auth configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDecision {
    Accept {
        user_id: Option<u64>,
        session_key: Option<[u8; SESSION_KEY_LEN]>,
    },
    Reject {
        reason: String,
    },
    /// The authority key is still being fetched; re-evaluate on a later pump.
    Deferred,
}

/// Pure login evaluation, factored out of the connection plumbing so the auth matrix is
///  directly testable. `now_unix` is seconds since the Unix epoch for expiry checks.
pub fn process_login(
    config: &NetConfig,
    authority: &AuthorityKeyState,
    addr: SocketAddr,
    login: &LoginPayload,
    now_unix: u64,
) -> LoginDecision {
    let session_key = match evaluate_key_offer(config, login) {
        Ok(session_key) => session_key,
        Err(reason) => return LoginDecision::Reject { reason },
    };

    let loopback_bypass = config.loopback_auth_bypass && addr.ip().is_loopback();
    if loopback_bypass && config.auth_mode != AuthMode::Disabled {
        // local tooling and same-host tests are trusted without a verifiable token
        debug!("loopback auth bypass for {}", addr);
        return LoginDecision::Accept {
            user_id: login.token.as_ref().map(|t| t.user_id),
            session_key,
        };
    }

    match (&config.auth_mode, &login.token) {
        (AuthMode::Disabled, _) => LoginDecision::Accept {
            user_id: None,
            session_key,
        },
        (AuthMode::Optional, None) => LoginDecision::Accept {
            user_id: None,
            session_key,
        },
        (AuthMode::Required, None) => LoginDecision::Reject {
            reason: REASON_AUTH_REQUIRED.to_string(),
        },
        (_, Some(token)) => match authority {
            AuthorityKeyState::Pending => LoginDecision::Deferred,
            AuthorityKeyState::Failed(e) => {
                warn!("rejecting login from {}: authority unavailable: {}", addr, e);
                LoginDecision::Reject {
                    reason: REASON_AUTH_UNAVAILABLE.to_string(),
                }
            }
            AuthorityKeyState::Ready(key) => match token.verify(key, now_unix) {
                Ok(()) => LoginDecision::Accept {
                    user_id: Some(token.user_id),
                    session_key,
                },
                Err(e) => {
                    let reason = if format!("{}", e).contains("expired") {
                        REASON_EXPIRED_TOKEN
                    } else {
                        REASON_INVALID_TOKEN
                    };
                    warn!("rejecting login from {}: {}", addr, reason);
                    LoginDecision::Reject {
                        reason: reason.to_string(),
                    }
                }
            },
        },
    }
}

fn evaluate_key_offer(
    config: &NetConfig,
    login: &LoginPayload,
) -> Result<Option<[u8; SESSION_KEY_LEN]>, String> {
    match (&login.session_key_offer, &config.server_secret_key) {
        (None, _) => {
            if config.encryption {
                Err(REASON_ENCRYPTION_REQUIRED.to_string())
            } else {
                Ok(None)
            }
        }
        (Some(_), None) => {
            // a plaintext server ignores an offer rather than failing the login
            debug!("ignoring session key offer, encryption is not configured");
            Ok(None)
        }
        (Some(offer), Some(secret)) => {
            match unwrap_session_key(secret, &offer.ephemeral_public, &offer.wrapped_key) {
                Ok(session_key) => Ok(Some(session_key)),
                Err(_) => Err(REASON_INVALID_SESSION_KEY.to_string()),
            }
        }
    }
}

/// Picks a free player name: the requested name if unused, otherwise the first unused of
///  `name_2`, `name_3`, ...
pub fn disambiguate_name(requested: &str, taken: &FxHashSet<String>) -> String {
    if !taken.contains(requested) {
        return requested.to_string();
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{}_{}", requested, suffix);
        if !taken.contains(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
