//! Typed decode of `agent` event payloads.
//!
//! The gateway sends loosely-typed maps; this module is the only place that
//! looks at raw JSON. Everything downstream works on [`AgentEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Timestamps below this are taken to be seconds rather than milliseconds.
/// 1e11 ms is March 1973, 1e11 s is far in the future.
const SECONDS_THRESHOLD: f64 = 1e11;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("agent event is not an object")]
    NotAnObject,

    #[error("malformed agent event: {0}")]
    Malformed(String),

    #[error("agent event missing `{0}`")]
    MissingField(&'static str),

    #[error("unknown agent stream `{0}`")]
    UnknownStream(String),

    #[error("unknown {stream} phase `{phase}`")]
    UnknownPhase { stream: &'static str, phase: String },

    #[error("invalid timestamp")]
    InvalidTimestamp,
}

/// One decoded agent event frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    /// Per-run sequence number. Absent on gateways that do not number frames.
    pub seq: Option<u64>,
    /// Milliseconds since the Unix epoch.
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stream", rename_all = "camelCase")]
pub enum AgentEventKind {
    Lifecycle(LifecycleEvent),
    Tool(ToolEvent),
    Thinking(TextEvent),
    Assistant(AssistantEvent),
    Compaction(CompactionEvent),
}

impl AgentEventKind {
    pub fn stream_name(&self) -> &'static str {
        match self {
            Self::Lifecycle(_) => "lifecycle",
            Self::Tool(_) => "tool",
            Self::Thinking(_) => "thinking",
            Self::Assistant(_) => "assistant",
            Self::Compaction(_) => "compaction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum LifecycleEvent {
    Start,
    End,
    Error { message: Option<String> },
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolPhase {
    Start,
    Update,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub phase: ToolPhase,
    pub tool_call_id: String,
    pub name: Option<String>,
    pub args: Option<Value>,
    pub partial_result: Option<Value>,
    pub result: Option<Value>,
    pub is_error: bool,
}

/// Reasoning text. `text` is an authoritative snapshot, `delta` may be an
/// increment or a cumulative restatement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TextEvent {
    pub text: Option<String>,
    pub delta: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantEvent {
    pub text: Option<String>,
    pub delta: Option<String>,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum CompactionEvent {
    Start,
    End {
        #[serde(rename = "willRetry")]
        will_retry: bool,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAgentEvent {
    stream: Option<String>,
    run_id: Option<String>,
    seq: Option<u64>,
    ts: Option<Value>,
    session_key: Option<String>,
    #[serde(default)]
    data: Map<String, Value>,
}

impl AgentEvent {
    /// Decode an `agent` event payload.
    ///
    /// Callers drop frames that fail here: the protocol adds stream kinds over
    /// time and older clients are expected to skip them.
    pub fn decode(payload: &Value) -> Result<Self, DecodeError> {
        if !payload.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let raw: RawAgentEvent = serde_json::from_value(payload.clone())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let stream = raw.stream.ok_or(DecodeError::MissingField("stream"))?;
        let run_id = raw
            .run_id
            .filter(|id| !id.is_empty())
            .ok_or(DecodeError::MissingField("runId"))?;
        let ts = normalize_timestamp(raw.ts.as_ref().ok_or(DecodeError::MissingField("ts"))?)
            .ok_or(DecodeError::InvalidTimestamp)?;

        let data = &raw.data;
        let kind = match stream.as_str() {
            "lifecycle" => AgentEventKind::Lifecycle(decode_lifecycle(data)?),
            "tool" => AgentEventKind::Tool(decode_tool(data)?),
            "thinking" => AgentEventKind::Thinking(TextEvent {
                text: string_field(data, "text"),
                delta: string_field(data, "delta"),
            }),
            "assistant" => AgentEventKind::Assistant(AssistantEvent {
                text: string_field(data, "text"),
                delta: string_field(data, "delta"),
                media_urls: media_urls(data),
            }),
            "compaction" => AgentEventKind::Compaction(decode_compaction(data)?),
            _ => return Err(DecodeError::UnknownStream(stream)),
        };

        Ok(Self {
            run_id,
            seq: raw.seq,
            ts,
            session_key: raw.session_key,
            kind,
        })
    }

    pub fn lifecycle(&self) -> Option<&LifecycleEvent> {
        match &self.kind {
            AgentEventKind::Lifecycle(lifecycle) => Some(lifecycle),
            _ => None,
        }
    }
}

/// Accepts numbers or numeric strings, in seconds or milliseconds.
pub fn normalize_timestamp(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    Some(if raw < SECONDS_THRESHOLD {
        raw * 1000.0
    } else {
        raw
    })
}

fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(String::from)
}

fn phase(data: &Map<String, Value>) -> Result<&str, DecodeError> {
    data.get("phase")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("phase"))
}

fn decode_lifecycle(data: &Map<String, Value>) -> Result<LifecycleEvent, DecodeError> {
    match phase(data)? {
        "start" => Ok(LifecycleEvent::Start),
        "end" => Ok(LifecycleEvent::End),
        "error" => Ok(LifecycleEvent::Error {
            message: string_field(data, "error").or_else(|| string_field(data, "message")),
        }),
        other => Err(DecodeError::UnknownPhase {
            stream: "lifecycle",
            phase: other.to_string(),
        }),
    }
}

fn decode_tool(data: &Map<String, Value>) -> Result<ToolEvent, DecodeError> {
    let phase = match phase(data)? {
        "start" => ToolPhase::Start,
        "update" => ToolPhase::Update,
        "result" => ToolPhase::Result,
        other => {
            return Err(DecodeError::UnknownPhase {
                stream: "tool",
                phase: other.to_string(),
            });
        },
    };
    let tool_call_id = string_field(data, "toolCallId")
        .filter(|id| !id.is_empty())
        .ok_or(DecodeError::MissingField("toolCallId"))?;
    Ok(ToolEvent {
        phase,
        tool_call_id,
        name: string_field(data, "name"),
        args: data.get("args").cloned(),
        partial_result: data.get("partialResult").cloned(),
        result: data.get("result").cloned(),
        is_error: data
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn decode_compaction(data: &Map<String, Value>) -> Result<CompactionEvent, DecodeError> {
    match phase(data)? {
        "start" => Ok(CompactionEvent::Start),
        "end" => Ok(CompactionEvent::End {
            will_retry: data
                .get("willRetry")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        other => Err(DecodeError::UnknownPhase {
            stream: "compaction",
            phase: other.to_string(),
        }),
    }
}

fn media_urls(data: &Map<String, Value>) -> Vec<String> {
    let mut urls: Vec<String> = data
        .get("mediaUrls")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if let Some(single) = string_field(data, "mediaUrl") {
        urls.push(single);
    }
    urls
}
