//! Client configuration.
//!
//! Loaded from `tether.toml` (platform config dir, or an explicit path). Every
//! field has a default, so an empty or missing file yields a working loopback
//! configuration. `TETHER_GATEWAY_URL` and `TETHER_GATEWAY_TOKEN` override the
//! file.

pub mod error;

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    secrecy::Secret,
    serde::Deserialize,
    tracing::{debug, warn},
    url::Url,
};

pub use error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "tether.toml";
pub const ENV_GATEWAY_URL: &str = "TETHER_GATEWAY_URL";
pub const ENV_GATEWAY_TOKEN: &str = "TETHER_GATEWAY_TOKEN";
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";
pub const DEFAULT_LAUNCH_AGENT_ENV: &str = "TETHER_LAUNCH_AGENT_TOKEN";

// ── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub gateway: GatewayConfig,
    pub reconnect: ReconnectConfig,
    pub timeouts: TimeoutConfig,
    pub health: HealthConfig,
    pub events: EventsConfig,
    pub credentials: CredentialsConfig,
    pub notice: NoticeConfig,
}

/// Where to connect and how to introduce ourselves.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `ws://` or `wss://` endpoint of the gateway.
    pub url: String,
    /// Explicit token. The only credential used for non-loopback gateways.
    pub token: Option<Secret<String>>,
    pub client_id: String,
    pub display_name: Option<String>,
    pub role: String,
    pub scopes: Vec<String>,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("client_id", &self.client_id)
            .field("display_name", &self.display_name)
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.into(),
            token: None,
            client_id: "tether".into(),
            display_name: None,
            role: "operator".into(),
            scopes: vec!["operator.admin".into()],
        }
    }
}

impl GatewayConfig {
    /// Parse and validate the configured URL.
    pub fn parsed_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|source| Error::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Bounded exponential backoff for the reconnect loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Fraction of each delay randomized in either direction (0.0–1.0).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transport connect plus `connect` handshake, per credential candidate.
    pub connect_ms: u64,
    /// Each request/response call.
    pub request_ms: u64,
    /// Each `agent.wait` poll issued by a resync sweep.
    pub wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            request_ms: 15_000,
            wait_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Frames buffered per subscriber before the oldest are dropped.
    pub buffer_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 200,
        }
    }
}

/// Locations of the read-only token sources tried for loopback gateways.
///
/// Unset paths fall back to the standard layout under `~/.tether`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub device_auth_path: Option<PathBuf>,
    pub paired_devices_path: Option<PathBuf>,
    pub legacy_config_path: Option<PathBuf>,
    /// Environment variable the launch agent provisions its token into.
    pub launch_agent_env: String,
    /// Device id used to look up this device in the paired registry.
    pub device_id: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            device_auth_path: None,
            paired_devices_path: None,
            legacy_config_path: None,
            launch_agent_env: DEFAULT_LAUNCH_AGENT_ENV.into(),
            device_id: None,
        }
    }
}

impl CredentialsConfig {
    pub fn device_auth_path(&self) -> Option<PathBuf> {
        self.device_auth_path
            .clone()
            .or_else(|| state_dir().map(|dir| dir.join("identity").join("device-auth.json")))
    }

    pub fn paired_devices_path(&self) -> Option<PathBuf> {
        self.paired_devices_path
            .clone()
            .or_else(|| state_dir().map(|dir| dir.join("devices").join("paired.json")))
    }

    pub fn legacy_config_path(&self) -> Option<PathBuf> {
        self.legacy_config_path
            .clone()
            .or_else(|| state_dir().map(|dir| dir.join("gateway.json")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoticeConfig {
    /// How long an auth failure waits for a recovering reconnect before it is
    /// surfaced.
    pub auth_grace_ms: u64,
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            auth_grace_ms: 5_000,
        }
    }
}

impl NoticeConfig {
    pub fn auth_grace(&self) -> Duration {
        Duration::from_millis(self.auth_grace_ms)
    }
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// `~/.tether`, where the gateway and its tooling keep state.
pub fn state_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".tether"))
}

/// Platform config directory for the client (`tether.toml` lives here).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "tether").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Parse a config file. Environment overrides are not applied.
pub fn load(path: &Path) -> Result<ClientConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&raw, path)
}

fn parse(raw: &str, path: &Path) -> Result<ClientConfig> {
    toml::from_str(raw).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `tether.toml` from the config dir if present, then apply environment
/// overrides. A broken file is logged and replaced by defaults.
pub fn discover_and_load() -> ClientConfig {
    let mut config = match config_dir().map(|dir| dir.join(CONFIG_FILE_NAME)) {
        Some(path) if path.exists() => load(&path).unwrap_or_else(|e| {
            warn!("{e}, using default client config");
            ClientConfig::default()
        }),
        _ => {
            debug!("no client config file found, using defaults");
            ClientConfig::default()
        },
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config
}

impl ClientConfig {
    /// Apply `TETHER_*` overrides from `lookup` (normally the process
    /// environment). Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_GATEWAY_URL) {
            self.gateway.url = url;
        }
        if let Some(token) = lookup(ENV_GATEWAY_TOKEN) {
            self.gateway.token = Some(Secret::new(token));
        }
    }
}
