use std::time::Duration;

use {serde::Serialize, serde_json::Value};

/// Stable identity of an item for the lifetime of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityItem {
    pub id: ItemId,
    /// Milliseconds since the Unix epoch of the frame that created the item.
    pub timestamp: f64,
    pub kind: ActivityKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompactionPhase {
    Started,
    Ended,
    WillRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecyclePhase {
    Started,
    Ended,
    Error(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActivityKind {
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        name: String,
        args: Option<Value>,
        status: ToolStatus,
        result: Option<Value>,
        is_error: bool,
        duration: Option<Duration>,
    },
    #[serde(rename_all = "camelCase")]
    Thinking {
        text: String,
        is_streaming: bool,
        duration: Option<Duration>,
    },
    #[serde(rename_all = "camelCase")]
    Assistant {
        text: String,
        is_streaming: bool,
        media_urls: Vec<String>,
    },
    Compaction { phase: CompactionPhase },
    #[serde(rename_all = "camelCase")]
    Lifecycle {
        phase: LifecyclePhase,
        run_id: String,
    },
}

impl ActivityItem {
    /// Running tool calls and open thinking/assistant items.
    pub fn is_in_flight(&self) -> bool {
        match &self.kind {
            ActivityKind::ToolCall { status, .. } => *status == ToolStatus::Running,
            ActivityKind::Thinking { is_streaming, .. }
            | ActivityKind::Assistant { is_streaming, .. } => *is_streaming,
            ActivityKind::Compaction { .. } | ActivityKind::Lifecycle { .. } => false,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            ActivityKind::Thinking { text, .. } | ActivityKind::Assistant { text, .. } => {
                Some(text)
            },
            _ => None,
        }
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.kind {
            ActivityKind::ToolCall { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}

/// Elapsed time between two millisecond timestamps. Out-of-order clocks give
/// zero; spans too large for a `Duration` saturate.
pub(crate) fn elapsed(start_ms: f64, end_ms: f64) -> Duration {
    let secs = (end_ms - start_ms) / 1000.0;
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
