//! Task that owns the session timeline and publishes snapshots of it.

use std::sync::Arc;

use {
    tether_protocol::agent::AgentEvent,
    tether_timeline::{ActivityItem, Timeline},
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

use crate::dispatcher::Subscription;

/// Most buffered events folded into one published snapshot.
const MAX_BATCH: usize = 256;

/// Point-in-time copy of the timeline. `revision` increases with every
/// published change.
#[derive(Debug, Clone, Default)]
pub struct TimelineSnapshot {
    pub revision: u64,
    pub items: Arc<Vec<ActivityItem>>,
    pub active_run: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineCommand {
    /// Drop finished items, keep in-flight ones.
    Clear,
    /// Start over for a new session.
    Reset,
}

pub struct TimelineFeed {
    timeline: Timeline,
    revision: u64,
    snapshots: watch::Sender<TimelineSnapshot>,
}

impl TimelineFeed {
    pub fn new() -> (Self, watch::Receiver<TimelineSnapshot>) {
        let (snapshots, rx) = watch::channel(TimelineSnapshot::default());
        (
            Self {
                timeline: Timeline::new(),
                revision: 0,
                snapshots,
            },
            rx,
        )
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Fold one event. Publishes only when something changed.
    pub fn apply(&mut self, event: &AgentEvent) {
        if self.fold(event) {
            self.publish();
        }
    }

    fn fold(&mut self, event: &AgentEvent) -> bool {
        !self.timeline.apply(event).is_empty()
    }

    /// Fold `first` plus whatever is already buffered behind it, then publish
    /// a single snapshot for the whole batch.
    fn apply_batch(&mut self, first: &AgentEvent, events: &mut Subscription<AgentEvent>) {
        let mut changed = self.fold(first);
        for _ in 1..MAX_BATCH {
            let Some(event) = events.try_recv() else {
                break;
            };
            changed |= self.fold(&event);
        }
        if changed {
            self.publish();
        }
    }

    pub fn command(&mut self, command: TimelineCommand) {
        match command {
            TimelineCommand::Clear => self.timeline.clear(),
            TimelineCommand::Reset => self.timeline.reset(),
        }
        debug!(?command, items = self.timeline.len(), "feed: timeline command");
        self.publish();
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.snapshots.send_replace(TimelineSnapshot {
            revision: self.revision,
            items: Arc::new(self.timeline.items().to_vec()),
            active_run: self.timeline.active_run().map(String::from),
        });
    }

    pub async fn run(
        mut self,
        mut events: Subscription<AgentEvent>,
        mut commands: mpsc::Receiver<TimelineCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.command(command),
                event = events.recv() => match event {
                    Some(event) => self.apply_batch(&event, &mut events),
                    None => break,
                },
            }
        }
        debug!("feed: stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*, crate::dispatcher::Dispatcher, serde_json::json, std::time::Duration,
        tether_timeline::ActivityKind,
    };

    fn event(stream: &str, data: serde_json::Value) -> AgentEvent {
        AgentEvent::decode(&json!({
            "runId": "r1",
            "stream": stream,
            "ts": 1_700_000_000_000u64,
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn publishes_only_on_change() {
        let (mut feed, rx) = TimelineFeed::new();
        feed.apply(&event("lifecycle", json!({ "phase": "start" })));
        assert_eq!(rx.borrow().revision, 1);

        feed.apply(&event("lifecycle", json!({ "phase": "start" })));
        assert_eq!(rx.borrow().revision, 1);

        feed.apply(&event("assistant", json!({ "delta": "Hi" })));
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.revision, 2);
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.active_run.as_deref(), Some("r1"));
    }

    #[test]
    fn commands_republish() {
        let (mut feed, rx) = TimelineFeed::new();
        feed.apply(&event("compaction", json!({ "phase": "start" })));
        feed.apply(&event(
            "tool",
            json!({ "phase": "start", "toolCallId": "t1", "name": "exec" }),
        ));

        feed.command(TimelineCommand::Clear);
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.items.len(), 1);
        assert!(matches!(snapshot.items[0].kind, ActivityKind::ToolCall { .. }));

        feed.command(TimelineCommand::Reset);
        assert!(rx.borrow().items.is_empty());
    }

    #[tokio::test]
    async fn buffered_events_publish_one_snapshot() {
        let dispatcher = Dispatcher::new();
        let events = dispatcher.subscribe(16);
        for delta in ["Hello", " world", "!"] {
            dispatcher.publish(event("assistant", json!({ "delta": delta })));
        }

        let (feed, mut rx) = TimelineFeed::new();
        let (_commands, commands_rx) = mpsc::channel(4);
        let task = tokio::spawn(feed.run(events, commands_rx, CancellationToken::new()));
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.items[0].text(), Some("Hello world!"));

        dispatcher.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn run_consumes_events_and_commands() {
        let dispatcher = Dispatcher::new();
        let (feed, mut rx) = TimelineFeed::new();
        let (commands, commands_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(feed.run(dispatcher.subscribe(16), commands_rx, cancel.clone()));

        dispatcher.publish(event("assistant", json!({ "delta": "Hello" })));
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow_and_update().items[0].text(), Some("Hello"));

        commands.send(TimelineCommand::Reset).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.borrow().items.is_empty());

        dispatcher.close();
        task.await.unwrap();
    }
}
