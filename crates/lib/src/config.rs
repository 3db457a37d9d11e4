//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.wumpus/config.json`) and environment.
//! Holds the credential, REST settings, and gateway session settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::intents::Intents;

const DEFAULT_API_HOST: &str = "https://discord.com";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Bot token. Overridden by WUMPUS_TOKEN env.
    pub token: Option<String>,

    /// REST API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Gateway session settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// REST base, auth scheme, and retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// REST API version (default 10).
    #[serde(default = "default_api_version")]
    pub version: u8,

    /// Override the REST base URL. Overridden by WUMPUS_API_BASE env.
    pub base_url: Option<String>,

    /// Scheme placed before the token in the Authorization header (default "Bot").
    /// Empty string sends the raw token.
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,

    /// Attempts for a request answered with 5xx before giving up (default 3).
    #[serde(default = "default_server_error_attempts")]
    pub max_server_error_attempts: u32,

    /// Retries after a 429 before surfacing RateLimited (default 5).
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Base delay between 5xx retries; grows linearly with the attempt number.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Whole-request timeout for one HTTP attempt (default 30000 ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_api_version() -> u8 {
    10
}

fn default_auth_prefix() -> String {
    "Bot".to_string()
}

fn default_server_error_attempts() -> u32 {
    3
}

fn default_rate_limit_retries() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            version: default_api_version(),
            base_url: None,
            auth_prefix: default_auth_prefix(),
            max_server_error_attempts: default_server_error_attempts(),
            max_rate_limit_retries: default_rate_limit_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ApiConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Transport compression negotiated in the connect URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Compression {
    /// Plain text frames.
    None,

    /// One zlib stream shared by every binary frame of the connection.
    #[default]
    ZlibStream,
}

impl Compression {
    /// Value of the `compress` query parameter, if any.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::ZlibStream => Some("zlib-stream"),
        }
    }
}

/// Gateway session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Gateway protocol version (default 10).
    #[serde(default = "default_gateway_version")]
    pub version: u8,

    #[serde(default)]
    pub compress: Compression,

    /// Intent bits sent with IDENTIFY. Defaults to every non-privileged intent.
    #[serde(default = "default_intents")]
    pub intents: u64,

    /// `[shard_id, shard_count]` for a sharded identify.
    pub shard: Option<[u32; 2]>,

    #[serde(default = "default_large_threshold")]
    pub large_threshold: u16,

    /// Upper bound on the heartbeat acknowledgement wait (default 3000 ms).
    /// The effective window never exceeds half of the server's interval.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// How long to wait for HELLO after the socket opens (default 30000 ms).
    #[serde(default = "default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,

    /// Bound on discovery plus the WebSocket upgrade; on expiry the attempt
    /// counts as a failed connection (default 30000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay; doubled per consecutive failure (default 1000 ms).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

fn default_gateway_version() -> u8 {
    10
}

fn default_intents() -> u64 {
    Intents::default().bits()
}

fn default_large_threshold() -> u16 {
    250
}

fn default_ack_timeout_ms() -> u64 {
    3000
}

fn default_hello_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    60_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: default_gateway_version(),
            compress: Compression::default(),
            intents: default_intents(),
            shard: None,
            large_threshold: default_large_threshold(),
            ack_timeout_ms: default_ack_timeout_ms(),
            hello_timeout_ms: default_hello_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect delay for the given number of consecutive failures (0 = first retry).
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let base = self.reconnect_delay_ms.max(1);
        let factor = 1u64.checked_shl(failures.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(self.max_reconnect_delay_ms.max(base)))
    }

    /// Build the connect URL: `<base>/?v=<version>&encoding=json[&compress=zlib-stream]`.
    pub fn connect_url(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        let mut url = format!("{}/?v={}&encoding=json", base, self.version);
        if let Some(c) = self.compress.query_value() {
            url.push_str("&compress=");
            url.push_str(c);
        }
        url
    }
}

fn non_blank(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolve the token: env WUMPUS_TOKEN overrides config.
pub fn resolve_token(config: &Config) -> Option<String> {
    std::env::var("WUMPUS_TOKEN")
        .ok()
        .and_then(|s| non_blank(&s))
        .or_else(|| config.token.as_deref().and_then(non_blank))
}

/// Resolve the REST base URL: env WUMPUS_API_BASE, then `api.baseUrl`, then the public host.
pub fn resolve_api_base(config: &Config) -> String {
    std::env::var("WUMPUS_API_BASE")
        .ok()
        .and_then(|s| non_blank(&s))
        .or_else(|| config.api.base_url.as_deref().and_then(non_blank))
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("{}/api/v{}", DEFAULT_API_HOST, config.api.version))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WUMPUS_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".wumpus").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or WUMPUS_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
