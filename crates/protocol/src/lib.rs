//! Gateway WebSocket/RPC protocol definitions, client side.
//!
//! All communication uses JSON text frames over a persistent connection.
//!
//! Frame types:
//! - `RequestFrame`: client → gateway RPC call
//! - `ResponseFrame`: gateway → client RPC result
//! - `EventFrame`: gateway → client server-push
//!
//! Agent activity arrives as `agent` events whose payload is decoded into the
//! typed [`AgentEvent`] before anything else looks at it.

pub mod agent;
pub mod health;

use serde::{Deserialize, Serialize};

pub use {
    agent::{
        AgentEvent, AgentEventKind, AssistantEvent, CompactionEvent, DecodeError, LifecycleEvent,
        TextEvent, ToolEvent, ToolPhase,
    },
    health::{HealthSnapshot, RunWaitResult, RunWaitStatus},
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;
pub const MIN_PROTOCOL_VERSION: u32 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s

// ── Methods and events ───────────────────────────────────────────────────────

pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const HEALTH: &str = "health";
    pub const AGENT_WAIT: &str = "agent.wait";
    pub const SYSTEM_PRESENCE: &str = "system-presence";
}

pub mod events {
    pub const AGENT: &str = "agent";
    pub const HEALTH: &str = "health";
    pub const TICK: &str = "tick";
    pub const SHUTDOWN: &str = "shutdown";
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Whether the gateway rejected the credential, as opposed to any other
    /// failure. Older gateways only put the word in the message.
    pub fn is_unauthorized(&self) -> bool {
        self.code == error_codes::UNAUTHORIZED
            || self.message.to_ascii_lowercase().contains("unauthorized")
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Connection-wide sequence number. Per-run ordering lives in the agent
    /// payload instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: None,
        }
    }
}

/// Discriminated union of all frame types, used when reading the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrameInner),
    #[serde(rename = "res")]
    Response(ResponseFrameInner),
    #[serde(rename = "event")]
    Event(EventFrameInner),
}

impl GatewayFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrameInner {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrameInner {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrameInner {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl ConnectParams {
    pub fn new(client: ClientInfo) -> Self {
        Self {
            min_protocol: MIN_PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client,
            role: None,
            scopes: None,
            auth: None,
            locale: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth = token.map(|token| ConnectAuth {
            token: Some(token),
            password: None,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Sent by the gateway after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    #[serde(default = "hello_ok_type")]
    pub r#type: String, // always "hello-ok"
    pub protocol: u32,
    pub server: ServerInfo,
    #[serde(default)]
    pub features: Features,
    /// Initial state snapshot. Only the embedded health block is read here.
    #[serde(default)]
    pub snapshot: serde_json::Value,
    #[serde(default)]
    pub policy: Policy,
}

fn hello_ok_type() -> String {
    "hello-ok".into()
}

impl HelloOk {
    /// Health block embedded in the hello snapshot, when the gateway sends one.
    pub fn health(&self) -> Option<HealthSnapshot> {
        self.snapshot
            .get("health")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}
