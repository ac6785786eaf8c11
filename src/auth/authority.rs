use anyhow::{anyhow, bail};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Where the authority's ed25519 verification key is at a given point in time. The fetch
///  is fire-and-forget; login processing consults the current state and defers while it
///  is still [AuthorityKeyState::Pending].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityKeyState {
    Pending,
    Ready(VerifyingKey),
    /// The fetch failed. This taints the session: token-based logins are rejected until
    ///  the process is restarted with a reachable authority.
    Failed(String),
}

/// Abstraction over the authority key lookup, mockable for tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    async fn fetch_key(&self) -> anyhow::Result<VerifyingKey>;
}

/// Fetches the key over HTTP. The endpoint returns the 32-byte key either raw or hex
///  encoded.
pub struct HttpKeySource {
    url: String,
    client: reqwest::Client,
}

impl HttpKeySource {
    pub fn new(url: String) -> HttpKeySource {
        HttpKeySource {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch_key(&self) -> anyhow::Result<VerifyingKey> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            bail!("authority returned status {}", response.status());
        }
        parse_key(&response.bytes().await?)
    }
}

fn parse_key(body: &[u8]) -> anyhow::Result<VerifyingKey> {
    let raw: [u8; 32] = if body.len() == 32 {
        let mut raw = [0u8; 32];
        raw.copy_from_slice(body);
        raw
    } else {
        let text = std::str::from_utf8(body)
            .map_err(|_| anyhow!("authority key is neither 32 raw bytes nor hex"))?
            .trim();
        if text.len() != 64 {
            bail!("authority key has unexpected length {}", text.len());
        }
        let mut raw = [0u8; 32];
        for (i, chunk) in raw.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&text[2 * i..2 * i + 2], 16)
                .map_err(|_| anyhow!("authority key is not valid hex"))?;
        }
        raw
    };
    VerifyingKey::from_bytes(&raw).map_err(|_| anyhow!("authority key is not a valid ed25519 key"))
}

/// Kicks off the key fetch on a background task and returns a watch receiver that starts
///  at [AuthorityKeyState::Pending] and transitions exactly once.
pub fn spawn_key_fetch(source: impl KeySource) -> watch::Receiver<AuthorityKeyState> {
    let (sender, receiver) = watch::channel(AuthorityKeyState::Pending);
    tokio::spawn(async move {
        let state = match source.fetch_key().await {
            Ok(key) => {
                debug!("authority key fetched");
                AuthorityKeyState::Ready(key)
            }
            Err(e) => {
                warn!("authority key fetch failed: {:#}", e);
                AuthorityKeyState::Failed(format!("{:#}", e))
            }
        };
        // the receiver being gone means the manager shut down already
        let _ = sender.send(state);
    });
    receiver
}
