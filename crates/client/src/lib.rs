//! Resilient client for a Tether gateway.
//!
//! [`GatewayClient`] wires the pieces together: the [`ConnectionController`]
//! owns the socket, a [`ResyncCoordinator`] task recovers from sequence gaps,
//! and a [`TimelineFeed`] task folds agent events into an activity timeline.
//! Each piece is also usable on its own.

pub mod backoff;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod notice;
pub mod resync;
pub mod transport;

use std::sync::Arc;

use {
    serde_json::Value,
    tether_config::ClientConfig,
    tether_protocol::agent::AgentEvent,
    tokio::sync::{broadcast, mpsc, watch},
    tracing::warn,
};

pub use crate::{
    connection::{ConnectionController, ConnectionEvent, ConnectionState, FailureReason, Session},
    credentials::{CredentialSources, EndpointClass, TokenSource},
    dispatcher::{Dispatcher, EventBuffer, Subscription},
    error::{CallError, ConnectError, ResyncError, TransportError},
    feed::{TimelineCommand, TimelineFeed, TimelineSnapshot},
    notice::AuthFailureNotice,
    resync::{RefreshReport, ResyncCommand, ResyncCoordinator, RunWaiter},
    transport::{Transport, WsTransport},
};

const COMMAND_CAPACITY: usize = 16;
const REPORT_CAPACITY: usize = 64;

pub struct GatewayClient {
    controller: ConnectionController,
    timeline: watch::Receiver<TimelineSnapshot>,
    timeline_commands: mpsc::Sender<TimelineCommand>,
    resync_commands: mpsc::Sender<ResyncCommand>,
    resync_reports: broadcast::Sender<RefreshReport>,
}

impl GatewayClient {
    /// Client over WebSocket with the credential sources named in `config`.
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> tether_config::Result<Self> {
        let credentials = CredentialSources::from_config(&config.credentials);
        Self::with_transport(config, credentials, Arc::new(WsTransport))
    }

    /// Must be called from within a Tokio runtime; background tasks start
    /// immediately and run until [`shutdown`](Self::shutdown).
    pub fn with_transport(
        config: ClientConfig,
        credentials: CredentialSources,
        transport: Arc<dyn Transport>,
    ) -> tether_config::Result<Self> {
        let capacity = config.events.buffer_capacity;
        let wait_timeout = config.timeouts.wait();
        let controller = ConnectionController::new(config, credentials, transport)?;

        let (resync_reports, _) = broadcast::channel(REPORT_CAPACITY);
        let (resync_commands, resync_rx) = mpsc::channel(COMMAND_CAPACITY);
        let coordinator =
            ResyncCoordinator::new(controller.clone(), wait_timeout, resync_reports.clone());
        controller.spawn(coordinator.run(
            controller.subscribe_events(capacity),
            controller.connection_events(),
            resync_rx,
            controller.shutdown_token(),
        ));

        let (feed, timeline) = TimelineFeed::new();
        let (timeline_commands, timeline_rx) = mpsc::channel(COMMAND_CAPACITY);
        controller.spawn(feed.run(
            controller.subscribe_events(capacity),
            timeline_rx,
            controller.shutdown_token(),
        ));

        Ok(Self {
            controller,
            timeline,
            timeline_commands,
            resync_commands,
            resync_reports,
        })
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.controller
    }

    pub async fn connect(&self) -> Result<Session, ConnectError> {
        self.controller.connect().await
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.controller.send(method, params).await
    }

    /// Raw agent events with this subscriber's own ring of `capacity`.
    pub fn subscribe_events(&self, capacity: usize) -> Subscription<AgentEvent> {
        self.controller.subscribe_events(capacity)
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.controller.watch_state()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.controller.connection_events()
    }

    pub fn timeline(&self) -> watch::Receiver<TimelineSnapshot> {
        self.timeline.clone()
    }

    pub fn resync_reports(&self) -> broadcast::Receiver<RefreshReport> {
        self.resync_reports.subscribe()
    }

    /// Drop finished timeline items. In-flight items and run tracking stay.
    pub async fn clear_timeline(&self) {
        if self
            .timeline_commands
            .send(TimelineCommand::Clear)
            .await
            .is_err()
        {
            warn!("client: timeline feed is not running");
        }
    }

    /// Forget the timeline and all run tracking, e.g. on a session switch.
    pub async fn reset_session(&self) {
        let timeline = self.timeline_commands.send(TimelineCommand::Reset).await;
        let resync = self.resync_commands.send(ResyncCommand::Reset).await;
        if timeline.is_err() || resync.is_err() {
            warn!("client: background tasks are not running");
        }
    }

    /// Poll every active and pending run now.
    pub async fn sweep(&self) {
        if self.resync_commands.send(ResyncCommand::Sweep).await.is_err() {
            warn!("client: resync coordinator is not running");
        }
    }

    /// Report auth failures that outlive the configured grace window.
    pub fn on_auth_failure<F>(&self, on_notice: F)
    where
        F: FnMut(usize) + Send + 'static,
    {
        let gate = AuthFailureNotice::new(self.controller.config().notice.auth_grace());
        self.controller.spawn(gate.run(
            self.controller.watch_state(),
            self.controller.shutdown_token(),
            on_notice,
        ));
    }

    pub fn disconnect(&self) {
        self.controller.disconnect();
    }

    /// Disconnect and stop every background task.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}
