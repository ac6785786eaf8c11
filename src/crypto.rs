use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

pub const SESSION_KEY_LEN: usize = 32;
/// session key + AES-GCM tag
pub const WRAPPED_KEY_LEN: usize = SESSION_KEY_LEN + 16;
const NONCE_LEN: usize = 12;

/// Per-connection symmetric cipher applied to application payloads (the outer packet
///  header stays plaintext so frames can be routed before decryption).
pub trait ConnectionCipher: Send + 'static {
    fn is_encrypting(&self) -> bool;

    fn encrypt(&self, plaintext: &[u8]) -> Bytes;

    fn decrypt(&self, wire: &[u8]) -> anyhow::Result<Bytes>;
}

/// Pass-through cipher for connections that never negotiated encryption.
pub struct NullCipher;
impl ConnectionCipher for NullCipher {
    fn is_encrypting(&self) -> bool {
        false
    }

    fn encrypt(&self, plaintext: &[u8]) -> Bytes {
        Bytes::copy_from_slice(plaintext)
    }

    fn decrypt(&self, wire: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(wire))
    }
}

/// AES-256-GCM with a 12-byte nonce built from a random fixed prefix and a per-packet
///  counter, so nonces are unique for the lifetime of the session key.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl Aes256GcmCipher {
    pub fn new(session_key: &[u8; SESSION_KEY_LEN]) -> Aes256GcmCipher {
        Aes256GcmCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(session_key)),
            nonce_fixed: OsRng.next_u32(),
            nonce_counter: AtomicU64::new(0),
        }
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(&self.nonce_counter.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        nonce
    }
}

impl ConnectionCipher for Aes256GcmCipher {
    fn is_encrypting(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: &[u8]) -> Bytes {
        let nonce = self.next_nonce();
        let ciphertext = match self.cipher.encrypt(Nonce::from_slice(&nonce), plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                error!("encryption error: {}", e);
                panic!("encryption error");
            }
        };

        let mut buf = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        buf.put_slice(&nonce);
        buf.put_slice(&ciphertext);
        buf.freeze()
    }

    fn decrypt(&self, wire: &[u8]) -> anyhow::Result<Bytes> {
        if wire.len() < NONCE_LEN + 16 {
            bail!("encrypted payload is too short ({} bytes)", wire.len());
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("cryptographically invalid payload"))?;
        Ok(Bytes::from(plaintext))
    }
}

pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generates the server's long-lived x25519 key pair `(secret, public)`. The public half
///  is distributed to clients out of band.
pub fn generate_server_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Wraps an offered session key under the server's known public key: ephemeral-static
///  Diffie-Hellman, SHA-256 KDF, AES-GCM key wrap. Returns the ephemeral public key the
///  server needs to derive the same wrapping key, and the wrapped session key.
pub fn wrap_session_key(
    server_public: &[u8; 32],
    session_key: &[u8; SESSION_KEY_LEN],
) -> ([u8; 32], [u8; WRAPPED_KEY_LEN]) {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*server_public));

    let kek = derive_wrapping_key(shared.as_bytes());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
    // the wrapping key is used exactly once, so a fixed nonce is fine
    let wrapped = match cipher.encrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), session_key.as_ref()) {
        Ok(wrapped) => wrapped,
        Err(e) => {
            error!("session key wrap error: {}", e);
            panic!("session key wrap error");
        }
    };

    let mut fixed = [0u8; WRAPPED_KEY_LEN];
    fixed.copy_from_slice(&wrapped);
    (ephemeral_public.to_bytes(), fixed)
}

pub fn unwrap_session_key(
    server_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    wrapped: &[u8; WRAPPED_KEY_LEN],
) -> anyhow::Result<[u8; SESSION_KEY_LEN]> {
    let secret = StaticSecret::from(*server_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*ephemeral_public));

    let kek = derive_wrapping_key(shared.as_bytes());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
    let session_key = cipher
        .decrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), wrapped.as_ref())
        .map_err(|_| anyhow!("offered session key failed to unwrap"))?;

    let mut fixed = [0u8; SESSION_KEY_LEN];
    fixed.copy_from_slice(&session_key);
    Ok(fixed)
}

fn derive_wrapping_key(shared: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(b"session key wrap v1");
    hasher.finalize().into()
}
