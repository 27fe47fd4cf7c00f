//! Liveness and run-wait payloads.

use serde::{Deserialize, Serialize};

/// Payload of the `health` method and the pushed `health` event.
///
/// A changed `pid` means the gateway process restarted, even when the socket
/// itself survived (for example behind a tunnel or proxy).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub pid: Option<u32>,
    /// Seconds since the gateway process started.
    pub uptime: Option<f64>,
    pub active_runs: Option<u64>,
    pub version: Option<String>,
}

/// Status reported by `agent.wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunWaitStatus {
    Ok,
    Error,
    Timeout,
    #[serde(other)]
    Unknown,
}

impl RunWaitStatus {
    /// The run has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWaitResult {
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: RunWaitStatus,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub ended_at: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}
