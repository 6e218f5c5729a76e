use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use url::Url;

use adoptly_chat::ChatConfig;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_SOCKET_URL: &str = "ws://127.0.0.1:3000/realtime";

/// Socket URL scheme that selects the in-process broker instead of a server.
pub const MEMORY_SOCKET_SCHEME: &str = "memory:";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub socket_url: String,
    pub credentials_path: PathBuf,
    pub http_timeout: Duration,
    pub chat: ChatConfig,
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let api_url = var("ADOPTLY_API_URL", DEFAULT_API_URL);
        let api_url = Url::parse(&api_url).with_context(|| format!("invalid ADOPTLY_API_URL {:?}", api_url))?;

        let http_timeout: u64 = var("ADOPTLY_HTTP_TIMEOUT_SECS", "20")
            .parse()
            .context("ADOPTLY_HTTP_TIMEOUT_SECS must be a number of seconds")?;
        let typing_idle: u64 = var("ADOPTLY_TYPING_IDLE_MS", "1000")
            .parse()
            .context("ADOPTLY_TYPING_IDLE_MS must be a number of milliseconds")?;
        let typing_ttl: u64 = var("ADOPTLY_TYPING_TTL_MS", "1500")
            .parse()
            .context("ADOPTLY_TYPING_TTL_MS must be a number of milliseconds")?;

        Ok(Self {
            api_url,
            socket_url: var("ADOPTLY_SOCKET_URL", DEFAULT_SOCKET_URL),
            credentials_path: PathBuf::from(var("ADOPTLY_CREDENTIALS_PATH", "adoptly-credentials.json")),
            http_timeout: Duration::from_secs(http_timeout),
            chat: ChatConfig {
                typing_idle: Duration::from_millis(typing_idle),
                peer_typing_ttl: Duration::from_millis(typing_ttl),
            },
        })
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.socket_url.starts_with(MEMORY_SOCKET_SCHEME)
    }
}
