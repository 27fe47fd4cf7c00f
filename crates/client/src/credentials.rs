//! Candidate credentials for the connect handshake.
//!
//! A loopback gateway may be reachable with any of several locally stored
//! tokens, and they go stale independently (re-pairing rotates the device
//! token, an old `gateway.json` lingers after migration). They are tried in a
//! fixed order until one is accepted. Remote gateways only ever see the
//! explicitly configured token.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use {
    secrecy::{ExposeSecret, Secret},
    tether_config::CredentialsConfig,
    tracing::{debug, warn},
    url::{Host, Url},
};

const DEVICE_AUTH_POINTER: &str = "/token";
const LEGACY_CONFIG_POINTER: &str = "/gateway/auth/token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Loopback,
    Remote,
}

impl EndpointClass {
    pub fn of(url: &Url) -> Self {
        let loopback = match url.host() {
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.');
                domain.eq_ignore_ascii_case("localhost")
            },
            Some(Host::Ipv4(ip)) => ip.is_loopback() || ip.is_unspecified(),
            Some(Host::Ipv6(ip)) => ip.is_loopback() || ip.is_unspecified(),
            None => false,
        };
        if loopback {
            Self::Loopback
        } else {
            Self::Remote
        }
    }
}

/// Token values read from every source, before ordering.
#[derive(Debug, Clone, Default)]
pub struct CandidateTokens {
    pub configured: Option<Secret<String>>,
    pub device_auth: Option<Secret<String>>,
    pub paired_device: Option<Secret<String>>,
    pub legacy_config: Option<Secret<String>>,
    pub launch_agent: Option<Secret<String>>,
}

/// Order the candidates for one connect attempt.
///
/// Loopback: configured, device-auth, paired registry, legacy config, then
/// the launch-agent token, which is only a last resort. Remote: the configured
/// token alone. Blank and repeated values are skipped.
pub fn resolve_candidates(class: EndpointClass, tokens: &CandidateTokens) -> Vec<Secret<String>> {
    let ordered: Vec<&Option<Secret<String>>> = match class {
        EndpointClass::Remote => vec![&tokens.configured],
        EndpointClass::Loopback => vec![
            &tokens.configured,
            &tokens.device_auth,
            &tokens.paired_device,
            &tokens.legacy_config,
            &tokens.launch_agent,
        ],
    };

    let mut out: Vec<Secret<String>> = Vec::new();
    for token in ordered.into_iter().flatten() {
        let value = token.expose_secret().trim();
        if value.is_empty() || out.iter().any(|seen| seen.expose_secret() == value) {
            continue;
        }
        out.push(Secret::new(value.to_string()));
    }
    out
}

// ── Sources ──────────────────────────────────────────────────────────────────

/// Read-only lookup of one stored token.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A string inside a JSON file, addressed by JSON pointer. A missing file is
/// simply "no token".
#[derive(Debug, Clone)]
pub struct JsonFileToken {
    path: PathBuf,
    pointer: String,
}

impl JsonFileToken {
    pub fn new(path: impl Into<PathBuf>, pointer: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pointer: pointer.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenSource for JsonFileToken {
    fn token(&self) -> Option<String> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "credentials: unreadable token file");
                return None;
            },
        };
        let doc: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credentials: token file is not valid JSON");
                return None;
            },
        };
        doc.pointer(&self.pointer)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
    }
}

#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenSource for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var).ok()
    }
}

/// The four local token sources tried for loopback gateways.
#[derive(Default)]
pub struct CredentialSources {
    device_auth: Option<Box<dyn TokenSource>>,
    paired_device: Option<Box<dyn TokenSource>>,
    legacy_config: Option<Box<dyn TokenSource>>,
    launch_agent: Option<Box<dyn TokenSource>>,
}

impl std::fmt::Debug for CredentialSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSources")
            .field("device_auth", &self.device_auth.is_some())
            .field("paired_device", &self.paired_device.is_some())
            .field("legacy_config", &self.legacy_config.is_some())
            .field("launch_agent", &self.launch_agent.is_some())
            .finish()
    }
}

impl CredentialSources {
    /// No local sources; only the configured token is ever offered.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CredentialsConfig) -> Self {
        let paired_device = match (config.paired_devices_path(), &config.device_id) {
            (Some(path), Some(device_id)) => Some(Box::new(JsonFileToken::new(
                path,
                format!("/{}/token", escape_pointer(device_id)),
            )) as Box<dyn TokenSource>),
            _ => None,
        };
        Self {
            device_auth: config.device_auth_path().map(|path| {
                Box::new(JsonFileToken::new(path, DEVICE_AUTH_POINTER)) as Box<dyn TokenSource>
            }),
            paired_device,
            legacy_config: config.legacy_config_path().map(|path| {
                Box::new(JsonFileToken::new(path, LEGACY_CONFIG_POINTER)) as Box<dyn TokenSource>
            }),
            launch_agent: Some(Box::new(EnvToken::new(config.launch_agent_env.clone()))),
        }
    }

    #[must_use]
    pub fn with_device_auth(mut self, source: impl TokenSource + 'static) -> Self {
        self.device_auth = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_paired_device(mut self, source: impl TokenSource + 'static) -> Self {
        self.paired_device = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_legacy_config(mut self, source: impl TokenSource + 'static) -> Self {
        self.legacy_config = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_launch_agent(mut self, source: impl TokenSource + 'static) -> Self {
        self.launch_agent = Some(Box::new(source));
        self
    }

    /// Read every source once. Called per connect attempt so rotated tokens
    /// are picked up on reconnect.
    pub fn collect(&self, configured: Option<&Secret<String>>) -> CandidateTokens {
        let read = |source: &Option<Box<dyn TokenSource>>| {
            source.as_ref().and_then(|s| s.token()).map(Secret::new)
        };
        CandidateTokens {
            configured: configured.cloned(),
            device_auth: read(&self.device_auth),
            paired_device: read(&self.paired_device),
            legacy_config: read(&self.legacy_config),
            launch_agent: read(&self.launch_agent),
        }
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
