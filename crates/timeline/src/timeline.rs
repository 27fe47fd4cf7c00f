use std::collections::HashMap;

use {
    tether_protocol::agent::{
        AgentEvent, AgentEventKind, AssistantEvent, CompactionEvent, LifecycleEvent, TextEvent,
        ToolEvent, ToolPhase,
    },
    tracing::debug,
};

use crate::{
    item::{
        ActivityItem, ActivityKind, CompactionPhase, ItemId, LifecyclePhase, ToolStatus, elapsed,
    },
    merge::MergeState,
    recent::RecentSet,
};

/// Finished tool calls remembered for replay suppression.
pub const FINISHED_TOOL_MEMORY: usize = 4096;
/// `(run, phase)` pairs remembered for lifecycle dedup.
pub const LIFECYCLE_MEMORY: usize = 1024;

/// Position-level change produced by [`Timeline::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    Inserted(usize),
    Updated(usize),
}

#[derive(Debug)]
struct OpenStream {
    pos: usize,
    merge: MergeState,
}

/// Ordered activity items for one session.
///
/// Items are created once and then mutated in place. Tool calls are keyed by
/// `toolCallId`; at most one thinking and one assistant item are open at a
/// time. Replay and dedup memory is bounded; the oldest keys are forgotten
/// first.
#[derive(Debug)]
pub struct Timeline {
    items: Vec<ActivityItem>,
    tool_index: HashMap<String, usize>,
    finished_tools: RecentSet<String>,
    thinking: Option<OpenStream>,
    assistant: Option<OpenStream>,
    active_run: Option<String>,
    lifecycle_seen: RecentSet<(String, &'static str)>,
    next_id: u64,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            tool_index: HashMap::new(),
            finished_tools: RecentSet::new(FINISHED_TOOL_MEMORY),
            thinking: None,
            assistant: None,
            active_run: None,
            lifecycle_seen: RecentSet::new(LIFECYCLE_MEMORY),
            next_id: 0,
        }
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ActivityItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&ActivityItem> {
        self.items.get(pos)
    }

    /// Run most recently started and not yet ended.
    pub fn active_run(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    /// The tool call item for `tool_call_id`, running or finished.
    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ActivityItem> {
        self.items
            .iter()
            .find(|item| item.tool_call_id() == Some(tool_call_id))
    }

    /// Fold one event into the timeline.
    pub fn apply(&mut self, event: &AgentEvent) -> Vec<TimelineChange> {
        let mut changes = Vec::new();
        match &event.kind {
            AgentEventKind::Lifecycle(lifecycle) => {
                self.on_lifecycle(event, lifecycle, &mut changes)
            },
            AgentEventKind::Tool(tool) => self.on_tool(event.ts, tool, &mut changes),
            AgentEventKind::Thinking(text) => self.on_thinking(event.ts, text, &mut changes),
            AgentEventKind::Assistant(assistant) => {
                self.on_assistant(event.ts, assistant, &mut changes)
            },
            AgentEventKind::Compaction(compaction) => {
                let phase = match compaction {
                    CompactionEvent::Start => CompactionPhase::Started,
                    CompactionEvent::End { will_retry: true } => CompactionPhase::WillRetry,
                    CompactionEvent::End { will_retry: false } => CompactionPhase::Ended,
                };
                changes.push(self.push(event.ts, ActivityKind::Compaction { phase }));
            },
        }
        changes
    }

    /// Drop finished items. Running tool calls and open streams survive, as
    /// does run and replay bookkeeping.
    pub fn clear(&mut self) {
        let mut remap = HashMap::new();
        let old = std::mem::take(&mut self.items);
        for (old_pos, item) in old.into_iter().enumerate() {
            if item.is_in_flight() {
                remap.insert(old_pos, self.items.len());
                self.items.push(item);
            }
        }

        self.tool_index = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| item.tool_call_id().map(|id| (id.to_string(), pos)))
            .collect();
        for cursor in [&mut self.thinking, &mut self.assistant] {
            *cursor = cursor.take().and_then(|mut open| {
                open.pos = *remap.get(&open.pos)?;
                Some(open)
            });
        }
        debug!(kept = self.items.len(), "timeline: cleared finished items");
    }

    /// Forget everything, including run and replay bookkeeping.
    pub fn reset(&mut self) {
        let next_id = self.next_id;
        *self = Self::default();
        // Ids stay unique across resets so projections never see a reused id.
        self.next_id = next_id;
    }

    fn push(&mut self, timestamp: f64, kind: ActivityKind) -> TimelineChange {
        let id = ItemId(self.next_id);
        self.next_id += 1;
        self.items.push(ActivityItem {
            id,
            timestamp,
            kind,
        });
        TimelineChange::Inserted(self.items.len() - 1)
    }

    fn close_streams(&mut self, ts: f64, changes: &mut Vec<TimelineChange>) {
        self.close_thinking(ts, changes);
        if let Some(open) = self.assistant.take()
            && let Some(item) = self.items.get_mut(open.pos)
            && let ActivityKind::Assistant { is_streaming, .. } = &mut item.kind
        {
            *is_streaming = false;
            changes.push(TimelineChange::Updated(open.pos));
        }
    }

    fn close_thinking(&mut self, ts: f64, changes: &mut Vec<TimelineChange>) {
        if let Some(open) = self.thinking.take()
            && let Some(item) = self.items.get_mut(open.pos)
        {
            let started = item.timestamp;
            if let ActivityKind::Thinking {
                is_streaming,
                duration,
                ..
            } = &mut item.kind
            {
                *is_streaming = false;
                *duration = Some(elapsed(started, ts));
                changes.push(TimelineChange::Updated(open.pos));
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    fn on_lifecycle(
        &mut self,
        event: &AgentEvent,
        lifecycle: &LifecycleEvent,
        changes: &mut Vec<TimelineChange>,
    ) {
        let (key, phase) = match lifecycle {
            LifecycleEvent::Start => ("start", LifecyclePhase::Started),
            LifecycleEvent::End => ("end", LifecyclePhase::Ended),
            LifecycleEvent::Error { message } => ("error", LifecyclePhase::Error(message.clone())),
        };
        if !self.lifecycle_seen.insert((event.run_id.clone(), key)) {
            debug!(run_id = %event.run_id, phase = key, "timeline: duplicate lifecycle ignored");
            return;
        }

        self.close_streams(event.ts, changes);
        if lifecycle.is_terminal() {
            if self.active_run.as_deref() == Some(event.run_id.as_str()) {
                self.active_run = None;
            }
        } else {
            self.active_run = Some(event.run_id.clone());
        }
        changes.push(self.push(event.ts, ActivityKind::Lifecycle {
            phase,
            run_id: event.run_id.clone(),
        }));
    }

    // ── Tools ───────────────────────────────────────────────────────────────

    fn on_tool(&mut self, ts: f64, tool: &ToolEvent, changes: &mut Vec<TimelineChange>) {
        if self.finished_tools.contains(&tool.tool_call_id) {
            debug!(tool_call_id = %tool.tool_call_id, phase = ?tool.phase, "timeline: tool replay ignored");
            return;
        }

        let pos = match self.tool_index.get(&tool.tool_call_id).copied() {
            Some(pos) => pos,
            None => {
                if tool.phase == ToolPhase::Start {
                    self.close_streams(ts, changes);
                }
                let change = self.push(ts, ActivityKind::ToolCall {
                    tool_call_id: tool.tool_call_id.clone(),
                    name: tool.name.clone().unwrap_or_default(),
                    args: tool.args.clone(),
                    status: ToolStatus::Running,
                    result: None,
                    is_error: false,
                    duration: None,
                });
                changes.push(change);
                let pos = self.items.len() - 1;
                self.tool_index.insert(tool.tool_call_id.clone(), pos);
                if tool.phase == ToolPhase::Start {
                    return;
                }
                pos
            },
        };

        let Some(item) = self.items.get_mut(pos) else {
            return;
        };
        let started = item.timestamp;
        let ActivityKind::ToolCall {
            name,
            args,
            status,
            result,
            is_error,
            duration,
            ..
        } = &mut item.kind
        else {
            return;
        };
        if name.is_empty()
            && let Some(n) = &tool.name
        {
            name.clone_from(n);
        }
        if args.is_none() {
            args.clone_from(&tool.args);
        }

        match tool.phase {
            ToolPhase::Start => {},
            ToolPhase::Update => {
                if tool.partial_result.is_some() {
                    result.clone_from(&tool.partial_result);
                }
            },
            ToolPhase::Result => {
                *status = if tool.is_error {
                    ToolStatus::Failed
                } else {
                    ToolStatus::Completed
                };
                *is_error = tool.is_error;
                if tool.result.is_some() {
                    result.clone_from(&tool.result);
                }
                *duration = Some(elapsed(started, ts));
                self.tool_index.remove(&tool.tool_call_id);
                self.finished_tools.insert(tool.tool_call_id.clone());
            },
        }
        if changes.last() != Some(&TimelineChange::Inserted(pos)) {
            changes.push(TimelineChange::Updated(pos));
        }
    }

    // ── Streaming text ──────────────────────────────────────────────────────

    fn on_thinking(&mut self, ts: f64, event: &TextEvent, changes: &mut Vec<TimelineChange>) {
        let Some(open) = self.thinking.as_mut() else {
            let mut merge = MergeState::default();
            let mut text = String::new();
            if !merge_into(&mut merge, &mut text, event.text.as_deref(), event.delta.as_deref()) {
                return;
            }
            changes.push(self.push(ts, ActivityKind::Thinking {
                text,
                is_streaming: true,
                duration: None,
            }));
            self.thinking = Some(OpenStream {
                pos: self.items.len() - 1,
                merge,
            });
            return;
        };

        if let Some(item) = self.items.get_mut(open.pos)
            && let ActivityKind::Thinking { text, .. } = &mut item.kind
            && merge_into(&mut open.merge, text, event.text.as_deref(), event.delta.as_deref())
        {
            changes.push(TimelineChange::Updated(open.pos));
        }
    }

    fn on_assistant(
        &mut self,
        ts: f64,
        event: &AssistantEvent,
        changes: &mut Vec<TimelineChange>,
    ) {
        let Some(open) = self.assistant.as_mut() else {
            let mut merge = MergeState::default();
            let mut text = String::new();
            let text_changed =
                merge_into(&mut merge, &mut text, event.text.as_deref(), event.delta.as_deref());
            if !text_changed && event.media_urls.is_empty() {
                return;
            }
            self.close_thinking(ts, changes);
            changes.push(self.push(ts, ActivityKind::Assistant {
                text,
                is_streaming: true,
                media_urls: event.media_urls.clone(),
            }));
            self.assistant = Some(OpenStream {
                pos: self.items.len() - 1,
                merge,
            });
            return;
        };

        let Some(item) = self.items.get_mut(open.pos) else {
            return;
        };
        let ActivityKind::Assistant {
            text, media_urls, ..
        } = &mut item.kind
        else {
            return;
        };
        let text_changed =
            merge_into(&mut open.merge, text, event.text.as_deref(), event.delta.as_deref());
        // Append-only: a URL sent twice is shown twice.
        media_urls.extend(event.media_urls.iter().cloned());
        if text_changed || !event.media_urls.is_empty() {
            changes.push(TimelineChange::Updated(open.pos));
        }
    }
}

/// Apply an explicit snapshot or a delta to `target`. Returns whether it
/// changed.
fn merge_into(
    merge: &mut MergeState,
    target: &mut String,
    text: Option<&str>,
    delta: Option<&str>,
) -> bool {
    match (text, delta) {
        (Some(text), _) => merge.set_snapshot(target, text),
        (None, Some(delta)) => merge.apply_delta(target, delta),
        (None, None) => false,
    }
}
