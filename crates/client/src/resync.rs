//! Sequence-gap detection and run resynchronization.
//!
//! Agent frames carry a per-run `seq`. A jump means frames were lost (usually
//! across a reconnect), so the affected run is polled with `agent.wait` to
//! learn whether it already finished. The tracker is a plain state machine;
//! the coordinator owns it and does the polling.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    tether_protocol::{
        agent::{AgentEvent, LifecycleEvent},
        health::RunWaitStatus,
    },
    tether_timeline::RecentSet,
    tokio::sync::{broadcast, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    connection::ConnectionEvent,
    dispatcher::Subscription,
    error::{CallError, ResyncError},
};

// ── Tracking ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTracking {
    pub active_runs: BTreeSet<String>,
    pub pending_resync: BTreeSet<String>,
    pub last_seq: HashMap<String, u64>,
    /// Recently finished runs. A late `start` for one of these is stale.
    pub finished: RecentSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub run_id: String,
    pub expected: u64,
    pub received: u64,
}

/// Per-run sequence bookkeeping.
#[derive(Debug, Default)]
pub struct GapTracker {
    tracking: RunTracking,
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracking(&self) -> &RunTracking {
        &self.tracking
    }

    /// Record one frame. Returns the gap it revealed, if any.
    pub fn observe(&mut self, event: &AgentEvent) -> Option<Gap> {
        let run_id = &event.run_id;
        let mut gap = None;

        if let Some(seq) = event.seq {
            let last = self.tracking.last_seq.get(run_id).copied();
            let expected = last.map_or(1, |l| l + 1);
            if seq > expected {
                self.tracking.pending_resync.insert(run_id.clone());
                gap = Some(Gap {
                    run_id: run_id.clone(),
                    expected,
                    received: seq,
                });
            }
            if last.is_none_or(|l| seq > l) {
                self.tracking.last_seq.insert(run_id.clone(), seq);
            }
        }

        match event.lifecycle() {
            Some(LifecycleEvent::Start) if !self.tracking.finished.contains(run_id) => {
                self.tracking.active_runs.insert(run_id.clone());
            },
            Some(LifecycleEvent::End | LifecycleEvent::Error { .. }) => {
                self.tracking.active_runs.remove(run_id);
                self.tracking.last_seq.remove(run_id);
                self.tracking.finished.insert(run_id.clone());
            },
            Some(LifecycleEvent::Start) => {
                debug!(run_id = %run_id, "resync: ignoring start for a finished run");
            },
            None => {},
        }

        gap
    }

    /// Runs to poll: every active or pending run plus the hint, sorted.
    pub fn refresh_targets(&self, hint: Option<&str>) -> Vec<String> {
        let mut targets: BTreeSet<&str> = self
            .tracking
            .active_runs
            .iter()
            .chain(&self.tracking.pending_resync)
            .map(String::as_str)
            .collect();
        if let Some(hint) = hint {
            targets.insert(hint);
        }
        targets.into_iter().map(String::from).collect()
    }

    /// The gateway reports the run finished.
    pub fn mark_terminal(&mut self, run_id: &str) {
        self.tracking.active_runs.remove(run_id);
        self.tracking.pending_resync.remove(run_id);
        self.tracking.last_seq.remove(run_id);
        self.tracking.finished.insert(run_id.to_string());
    }

    pub fn reset(&mut self) {
        self.tracking = RunTracking::default();
    }
}

// ── Coordinator ─────────────────────────────────────────────────────────────

/// Asks the gateway whether a run has finished.
#[async_trait]
pub trait RunWaiter: Send + Sync {
    async fn wait_run(&self, run_id: &str) -> Result<RunWaitStatus, CallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Gap,
    Reconnect,
    Sweep,
    /// The event buffer evicted frames the coordinator never saw.
    Overflow,
}

/// Outcome of one refresh, broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub trigger: RefreshTrigger,
    pub hint: Option<String>,
    pub polled: Vec<String>,
    /// Runs the gateway reported finished; no longer tracked.
    pub terminal: Vec<String>,
    /// Runs whose poll failed; still pending.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncCommand {
    /// Poll every active and pending run now.
    Sweep,
    /// Forget all tracking (session switch).
    Reset,
}

enum PollOutcome {
    Status(RunWaitStatus),
    Failed(ResyncError),
}

pub struct ResyncCoordinator<W> {
    tracker: GapTracker,
    waiter: W,
    wait_timeout: Duration,
    reports: broadcast::Sender<RefreshReport>,
}

impl<W: RunWaiter> ResyncCoordinator<W> {
    pub fn new(waiter: W, wait_timeout: Duration, reports: broadcast::Sender<RefreshReport>) -> Self {
        Self {
            tracker: GapTracker::new(),
            waiter,
            wait_timeout,
            reports,
        }
    }

    pub fn tracker(&self) -> &GapTracker {
        &self.tracker
    }

    /// Track one frame and refresh right away if it revealed a gap. Every gap
    /// gets its own refresh.
    pub async fn handle_event(&mut self, event: &AgentEvent) -> Option<RefreshReport> {
        let gap = self.tracker.observe(event)?;
        warn!(
            run_id = %gap.run_id,
            expected = gap.expected,
            received = gap.received,
            "resync: sequence gap"
        );
        Some(self.refresh(Some(&gap.run_id), RefreshTrigger::Gap).await)
    }

    /// Poll every active and pending run, plus `hint`, concurrently.
    pub async fn refresh(&mut self, hint: Option<&str>, trigger: RefreshTrigger) -> RefreshReport {
        let polled = self.tracker.refresh_targets(hint);
        let waiter = &self.waiter;
        let wait_timeout = self.wait_timeout;

        let outcomes = join_all(polled.iter().map(|run_id| async move {
            let outcome = match tokio::time::timeout(wait_timeout, waiter.wait_run(run_id)).await {
                Ok(Ok(status)) => PollOutcome::Status(status),
                Ok(Err(source)) => PollOutcome::Failed(ResyncError::GapResyncFailure {
                    run_id: run_id.clone(),
                    source,
                }),
                // Still running as far as we can tell.
                Err(_) => PollOutcome::Status(RunWaitStatus::Timeout),
            };
            (run_id, outcome)
        }))
        .await;

        let mut terminal = Vec::new();
        let mut failed = Vec::new();
        for (run_id, outcome) in outcomes {
            match outcome {
                PollOutcome::Status(status) if status.is_terminal() => {
                    self.tracker.mark_terminal(run_id);
                    terminal.push(run_id.clone());
                },
                PollOutcome::Status(status) => {
                    debug!(run_id = %run_id, ?status, "resync: run still in progress");
                },
                PollOutcome::Failed(err) => {
                    warn!(error = %err, "resync: poll failed, keeping run pending");
                    failed.push(run_id.clone());
                },
            }
        }

        let report = RefreshReport {
            trigger,
            hint: hint.map(String::from),
            polled,
            terminal,
            failed,
        };
        debug!(?report, "resync: refresh complete");
        let _ = self.reports.send(report.clone());
        report
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    /// Task body: track frames, refresh on gaps, sweep after reconnects and on
    /// request. Ends on cancellation or when the event subscription closes.
    pub async fn run(
        mut self,
        mut events: Subscription<AgentEvent>,
        mut connection: broadcast::Receiver<ConnectionEvent>,
        mut commands: mpsc::Receiver<ResyncCommand>,
        cancel: CancellationToken,
    ) {
        let mut connection_open = true;
        let mut seen_dropped = events.dropped();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    ResyncCommand::Sweep => {
                        self.refresh(None, RefreshTrigger::Sweep).await;
                    },
                    ResyncCommand::Reset => {
                        info!("resync: tracking reset");
                        self.reset();
                    },
                },
                event = connection.recv(), if connection_open => match event {
                    Ok(ConnectionEvent::Reconnected) => {
                        self.refresh(None, RefreshTrigger::Reconnect).await;
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "resync: missed connection events, sweeping");
                        self.refresh(None, RefreshTrigger::Reconnect).await;
                    },
                    Err(broadcast::error::RecvError::Closed) => connection_open = false,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(&event).await;
                        // Frames evicted while we were polling may include a
                        // run's end; only a sweep can recover that.
                        let dropped = events.dropped();
                        if dropped > seen_dropped {
                            warn!(
                                lost = dropped - seen_dropped,
                                "resync: event buffer overflowed, sweeping"
                            );
                            seen_dropped = dropped;
                            self.refresh(None, RefreshTrigger::Overflow).await;
                        }
                    },
                    None => break,
                },
            }
        }
        debug!("resync: coordinator stopped");
    }
}
