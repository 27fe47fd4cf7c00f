//! End-to-end gap recovery and timeline reconstruction through
//! [`GatewayClient`].

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use {
    rand::seq::SliceRandom,
    serde_json::{Value, json},
    tether_client::{
        CredentialSources, GatewayClient, RefreshReport, TimelineSnapshot,
        resync::{GapTracker, RefreshTrigger},
    },
    tether_protocol::agent::AgentEvent,
    tether_timeline::{ActivityKind, LifecyclePhase, ToolStatus},
    tokio::sync::{broadcast, watch},
};

use common::{FakeGateway, LOOPBACK_URL, agent_payload, init_tracing, test_config, within};

async fn client(gateway: &FakeGateway) -> GatewayClient {
    init_tracing();
    let client = GatewayClient::with_transport(
        test_config(LOOPBACK_URL),
        CredentialSources::none(),
        gateway.transport(),
    )
    .unwrap();
    client.connect().await.unwrap();
    client
}

async fn next_report(
    reports: &mut broadcast::Receiver<RefreshReport>,
    trigger: RefreshTrigger,
) -> RefreshReport {
    within("refresh report", async {
        loop {
            let report = reports.recv().await.unwrap();
            if report.trigger == trigger {
                return report;
            }
        }
    })
    .await
}

async fn wait_timeline(
    timeline: &mut watch::Receiver<TimelineSnapshot>,
    ready: impl Fn(&TimelineSnapshot) -> bool,
) -> TimelineSnapshot {
    within("timeline", timeline.wait_for(|s| ready(s)))
        .await
        .unwrap()
        .clone()
}

#[tokio::test]
async fn reconnect_sweeps_active_runs() {
    let gateway = FakeGateway::new().anonymous();
    let client = client(&gateway).await;
    let mut reports = client.resync_reports();
    let mut timeline = client.timeline();

    gateway.push_agent(agent_payload("r1", Some(1), "lifecycle", json!({ "phase": "start" })));
    gateway.push_agent(agent_payload("r2", Some(1), "lifecycle", json!({ "phase": "start" })));
    gateway.set_run_status("r1", "ok");
    wait_timeline(&mut timeline, |s| s.items.len() == 2).await;
    // The coordinator reads the same frames on its own subscription.
    tokio::time::sleep(Duration::from_millis(20)).await;

    gateway.drop_links();
    let report = next_report(&mut reports, RefreshTrigger::Reconnect).await;
    assert_eq!(report.polled, vec!["r1", "r2"]);
    assert_eq!(report.terminal, vec!["r1"]);
    assert!(report.failed.is_empty());

    client.sweep().await;
    let report = next_report(&mut reports, RefreshTrigger::Sweep).await;
    assert_eq!(report.polled, vec!["r2"]);
    client.shutdown().await;
}

#[tokio::test]
async fn reset_session_forgets_runs_and_timeline() {
    let gateway = FakeGateway::new().anonymous();
    let client = client(&gateway).await;
    let mut reports = client.resync_reports();
    let mut timeline = client.timeline();

    gateway.push_agent(agent_payload("r1", Some(1), "lifecycle", json!({ "phase": "start" })));
    wait_timeline(&mut timeline, |s| s.items.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.reset_session().await;
    wait_timeline(&mut timeline, |s| s.items.is_empty()).await;
    client.sweep().await;
    let report = next_report(&mut reports, RefreshTrigger::Sweep).await;
    assert!(report.polled.is_empty());
    client.shutdown().await;
}

// ── Gap / lifecycle-end race ────────────────────────────────────────────────

fn race_frames(run_id: &str) -> Vec<Value> {
    vec![
        agent_payload(run_id, Some(1), "lifecycle", json!({ "phase": "start" })),
        agent_payload(run_id, Some(2), "assistant", json!({ "delta": "a" })),
        agent_payload(run_id, Some(3), "assistant", json!({ "delta": "b" })),
        agent_payload(run_id, Some(4), "assistant", json!({ "delta": "c" })),
        agent_payload(run_id, Some(5), "lifecycle", json!({ "phase": "end" })),
    ]
}

/// Gaps the coordinator will see for `frames`, given the gateway reports the
/// run finished on every poll.
fn expected_gaps(frames: &[Value]) -> usize {
    let mut tracker = GapTracker::new();
    let mut gaps = 0;
    for frame in frames {
        let event = AgentEvent::decode(frame).unwrap();
        if let Some(gap) = tracker.observe(&event) {
            gaps += 1;
            tracker.mark_terminal(&gap.run_id);
        }
    }
    gaps
}

#[tokio::test]
async fn gap_and_end_race_always_refreshes() {
    let gateway = FakeGateway::new().anonymous();
    let client = client(&gateway).await;
    let mut reports = client.resync_reports();
    let mut rng = rand::rng();

    for round in 0..24 {
        let run_id = format!("race-{round}");
        gateway.set_run_status(&run_id, "ok");

        let mut frames = race_frames(&run_id);
        // Lose one middle frame, then deliver the rest in random order. Even
        // rounds keep the end frame last; odd rounds shuffle it too.
        frames.remove(1 + round % 3);
        if round % 2 == 0 {
            frames[..3].shuffle(&mut rng);
        } else {
            frames.shuffle(&mut rng);
        }
        let gaps = expected_gaps(&frames);
        assert!(gaps >= 1, "round {round} lost a frame without a gap");

        for frame in &frames {
            gateway.push_agent(frame.clone());
        }
        for _ in 0..gaps {
            let report = next_report(&mut reports, RefreshTrigger::Gap).await;
            assert_eq!(report.hint.as_deref(), Some(run_id.as_str()));
            assert!(report.polled.contains(&run_id));
            assert!(report.terminal.contains(&run_id), "round {round}: {report:?}");
        }

        // Nothing about the run is left behind.
        client.sweep().await;
        let report = next_report(&mut reports, RefreshTrigger::Sweep).await;
        assert!(
            !report.polled.contains(&run_id),
            "round {round} left {run_id} tracked: {report:?}"
        );
    }

    let waited = gateway.waited();
    for round in 0..24 {
        let run_id = format!("race-{round}");
        assert!(waited.contains(&run_id), "no poll for {run_id}");
    }
    client.shutdown().await;
}

// ── Reconstruction ──────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_frame_scenario() {
    let gateway = FakeGateway::new().anonymous();
    let client = client(&gateway).await;
    let mut reports = client.resync_reports();
    let mut timeline = client.timeline();

    gateway.push_agent(agent_payload("R", Some(1), "lifecycle", json!({ "phase": "start" })));
    gateway.push_agent(agent_payload(
        "R",
        None,
        "tool",
        json!({ "phase": "start", "toolCallId": "T1", "name": "read_file" }),
    ));
    gateway.push_agent(agent_payload(
        "R",
        None,
        "tool",
        json!({ "phase": "result", "toolCallId": "T1", "isError": false, "result": "ok" }),
    ));
    gateway.push_agent(agent_payload("R", Some(3), "assistant", json!({ "delta": "Hi" })));

    let report = next_report(&mut reports, RefreshTrigger::Gap).await;
    assert_eq!(report.hint.as_deref(), Some("R"));
    assert_eq!(report.polled, vec!["R"]);

    let snapshot = wait_timeline(&mut timeline, |s| {
        s.items.iter().any(|item| item.text() == Some("Hi"))
    })
    .await;
    assert_eq!(snapshot.items.len(), 3);
    assert!(matches!(
        &snapshot.items[0].kind,
        ActivityKind::Lifecycle { phase: LifecyclePhase::Started, .. }
    ));
    assert!(matches!(
        &snapshot.items[1].kind,
        ActivityKind::ToolCall { status: ToolStatus::Completed, is_error: false, .. }
    ));
    assert!(matches!(&snapshot.items[2].kind, ActivityKind::Assistant { .. }));
    assert_eq!(snapshot.items[2].text(), Some("Hi"));

    // Exactly one gap: a sweep is the next report, not another gap refresh.
    client.sweep().await;
    let report = within("report", reports.recv()).await.unwrap();
    assert_eq!(report.trigger, RefreshTrigger::Sweep);
    assert_eq!(gateway.waited(), vec!["R", "R"]);
    client.shutdown().await;
}

#[tokio::test]
async fn cumulative_deltas_render_once() {
    let gateway = FakeGateway::new().anonymous();
    let client = client(&gateway).await;
    let mut timeline = client.timeline();

    for (seq, delta) in [(1, "Hello"), (2, "Hello there"), (3, "Hello there, friend")] {
        gateway.push_agent(agent_payload("r1", Some(seq), "assistant", json!({ "delta": delta })));
    }
    let snapshot = wait_timeline(&mut timeline, |s| {
        s.items
            .first()
            .and_then(|item| item.text())
            .is_some_and(|text| text.ends_with("friend"))
    })
    .await;
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].text(), Some("Hello there, friend"));

    client.clear_timeline().await;
    client.shutdown().await;
}
