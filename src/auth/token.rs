use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use tracing::warn;

use crate::wire::{put_string, try_get_array, try_get_string};

pub const SIGNATURE_LEN: usize = 64;

/// An authentication token issued by the authority and presented by clients during login.
///  The signature covers `user_id`, `name` and `expires_at` and is verified against the
///  authority's ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub user_id: u64,
    pub name: String,
    /// seconds since the Unix epoch
    pub expires_at: u64,
    pub signature: [u8; SIGNATURE_LEN],
}

impl AuthToken {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.user_id);
        put_string(buf, &self.name);
        buf.put_u64(self.expires_at);
        buf.put_slice(&self.signature);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AuthToken> {
        if buf.remaining() < 8 {
            bail!("auth token truncated");
        }
        let user_id = buf.get_u64();
        let name = try_get_string(buf)?;
        if buf.remaining() < 8 {
            bail!("auth token truncated");
        }
        let expires_at = buf.get_u64();
        let signature = try_get_array::<SIGNATURE_LEN>(buf)?;
        Ok(AuthToken {
            user_id,
            name,
            expires_at,
            signature,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    fn signed_portion(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(self.user_id);
        put_string(&mut buf, &self.name);
        buf.put_u64(self.expires_at);
        buf.freeze()
    }

    /// Issues a signed token. This lives on the authority, not in game servers; it is
    ///  part of the crate so tests and tooling can mint tokens.
    pub fn issue(signing_key: &SigningKey, user_id: u64, name: &str, expires_at: u64) -> AuthToken {
        let mut token = AuthToken {
            user_id,
            name: name.to_string(),
            expires_at,
            signature: [0u8; SIGNATURE_LEN],
        };
        token.signature = signing_key.sign(&token.signed_portion()).to_bytes();
        token
    }

    /// Checks the signature and expiry. `now` is seconds since the Unix epoch.
    pub fn verify(&self, authority_key: &VerifyingKey, now: u64) -> anyhow::Result<()> {
        let signature = Signature::from_bytes(&self.signature);
        authority_key
            .verify_strict(&self.signed_portion(), &signature)
            .map_err(|_| anyhow!("invalid token signature"))?;
        if self.expires_at <= now {
            warn!("rejecting expired token for user {}", self.user_id);
            bail!("expired token");
        }
        Ok(())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn signing_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn test_token_ser_deser_round_trip() {
        let token = AuthToken::issue(&signing_key(), 42, "alice", 2_000_000_000);
        let mut buf = BytesMut::new();
        token.ser(&mut buf);
        assert_eq!(AuthToken::try_deser(&mut buf.freeze()).unwrap(), token);
    }

    #[test]
    fn test_valid_token_verifies() {
        let key = signing_key();
        let token = AuthToken::issue(&key, 42, "alice", 1000);
        assert!(token.verify(&key.verifying_key(), 999).is_ok());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let key = signing_key();
        let token = AuthToken::issue(&key, 42, "alice", 1000);
        assert!(token.verify(&key.verifying_key(), 1000).is_err());
        assert!(token.verify(&key.verifying_key(), 1001).is_err());
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let key = signing_key();
        let mut token = AuthToken::issue(&key, 42, "alice", 2_000_000_000);
        token.name = "mallory".to_string();
        assert!(token.verify(&key.verifying_key(), 0).is_err());
    }

    #[test]
    fn test_token_signed_by_other_key_is_rejected() {
        let token = AuthToken::issue(&signing_key(), 42, "alice", 2_000_000_000);
        assert!(token.verify(&signing_key().verifying_key(), 0).is_err());
    }

    #[test]
    fn test_truncated_token_fails_deser() {
        let token = AuthToken::issue(&signing_key(), 42, "alice", 2_000_000_000);
        let wire = token.to_bytes();
        let mut truncated = wire.slice(..wire.len() - 1);
        assert!(AuthToken::try_deser(&mut truncated).is_err());
    }
}
