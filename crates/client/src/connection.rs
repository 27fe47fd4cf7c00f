//! Gateway connection controller.
//!
//! Owns the single persistent link: the credential handshake, request/response
//! correlation, inbound frame routing, liveness polling and the reconnect
//! loop. State changes are published on a `watch` channel and lifecycle
//! notifications on a `broadcast` channel; nothing else mutates them.

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    futures::{SinkExt, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tether_config::ClientConfig,
    tether_protocol::{
        ClientInfo, ConnectParams, ErrorShape, GatewayFrame, HelloOk, RequestFrame,
        ResponseFrameInner,
        agent::AgentEvent,
        error_codes, events,
        health::{HealthSnapshot, RunWaitResult, RunWaitStatus},
        methods,
    },
    tokio::{
        sync::{broadcast, mpsc, oneshot, watch},
        time::MissedTickBehavior,
    },
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::{debug, error, info, trace, warn},
    url::Url,
    uuid::Uuid,
};

use crate::{
    backoff::Backoff,
    credentials::{CredentialSources, EndpointClass, resolve_candidates},
    dispatcher::{Dispatcher, Subscription},
    error::{CallError, ConnectError, TransportError},
    resync::RunWaiter,
    transport::{FrameSink, FrameStream, Transport},
};

const OUTBOUND_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    AuthFailed { attempts: usize },
    ReconnectExhausted { attempts: u32 },
    Transport(String),
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// A link was re-established after an unexpected loss.
    Reconnected,
    Disconnected,
    /// The gateway process changed under a live link.
    PeerRestarted { previous: u32, current: u32 },
    AuthFailed { attempts: usize },
}

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub hello: HelloOk,
    pub endpoint: EndpointClass,
    /// 1-based position of the accepted credential among those tried.
    pub attempts: usize,
}

// ── Internals ───────────────────────────────────────────────────────────────

struct Link {
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    generation: u64,
}

enum HandshakeError {
    Unauthorized(String),
    Fatal(ConnectError),
}

enum ReconnectOutcome {
    Connected,
    AuthFailed(usize),
    Exhausted(u32),
    Cancelled,
}

/// Removes a pending request entry when the caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<ResponseFrameInner>>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

struct Inner {
    url: Url,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    credentials: CredentialSources,
    client: ClientInfo,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    pending: DashMap<String, oneshot::Sender<ResponseFrameInner>>,
    link: Mutex<Option<Link>>,
    /// Parent of every link and of the reconnect loop. Replaced after an
    /// intentional disconnect.
    session: Mutex<CancellationToken>,
    agent_events: Dispatcher<AgentEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    reconnecting: AtomicBool,
    generation: AtomicU64,
    /// `(link generation, pid)` of the gateway process last seen.
    peer: Mutex<Option<(u64, u32)>>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl ConnectionController {
    pub fn new(
        config: ClientConfig,
        credentials: CredentialSources,
        transport: Arc<dyn Transport>,
    ) -> tether_config::Result<Self> {
        let url = config.gateway.parsed_url()?;
        let client = ClientInfo {
            id: config.gateway.client_id.clone(),
            display_name: config.gateway.display_name.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            mode: "client".into(),
            instance_id: Some(Uuid::new_v4().to_string()),
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let session = shutdown.child_token();
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                transport,
                credentials,
                client,
                state,
                events,
                pending: DashMap::new(),
                link: Mutex::new(None),
                session: Mutex::new(session),
                agent_events: Dispatcher::new(),
                shutdown,
                tasks: TaskTracker::new(),
                reconnecting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                peer: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Decoded agent events, buffered per subscriber.
    pub fn subscribe_events(&self, capacity: usize) -> Subscription<AgentEvent> {
        self.inner.agent_events.subscribe(capacity)
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Run `task` under this controller's tracker so `shutdown` waits for it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(task);
    }

    // ── Connect ─────────────────────────────────────────────────────────────

    /// Open the link, trying each candidate credential in order.
    pub async fn connect(&self) -> Result<Session, ConnectError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectError::Shutdown);
        }
        // Supersedes any reconnect loop still running.
        self.renew_session();
        self.drop_link();
        self.set_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok(session) => {
                self.set_state(ConnectionState::Connected);
                self.announce_presence().await;
                self.emit(ConnectionEvent::Connected);
                Ok(session)
            },
            Err(err) => {
                self.set_state(ConnectionState::Failed(failure_reason(&err)));
                if let ConnectError::AuthFailed { attempts } = err {
                    error!(attempts, url = %self.inner.url, "connection: every credential was rejected");
                    self.emit(ConnectionEvent::AuthFailed { attempts });
                } else {
                    warn!(error = %err, url = %self.inner.url, "connection: connect failed");
                }
                Err(err)
            },
        }
    }

    async fn establish(&self) -> Result<Session, ConnectError> {
        let endpoint = EndpointClass::of(&self.inner.url);
        let tokens = self
            .inner
            .credentials
            .collect(self.inner.config.gateway.token.as_ref());
        let mut candidates: Vec<Option<Secret<String>>> = resolve_candidates(endpoint, &tokens)
            .into_iter()
            .map(Some)
            .collect();
        if candidates.is_empty() {
            candidates.push(None);
        }
        let total = candidates.len();

        for (index, token) in candidates.iter().enumerate() {
            if self.inner.shutdown.is_cancelled() {
                return Err(ConnectError::Shutdown);
            }
            match self.handshake(token.as_ref()).await {
                Ok((hello, sink, stream)) => {
                    info!(
                        url = %self.inner.url,
                        server = %hello.server.version,
                        candidate = index + 1,
                        "connection: handshake complete"
                    );
                    self.attach(sink, stream, &hello);
                    return Ok(Session {
                        hello,
                        endpoint,
                        attempts: index + 1,
                    });
                },
                Err(HandshakeError::Unauthorized(detail)) => {
                    warn!(
                        candidate = index + 1,
                        total,
                        detail = %detail,
                        "connection: credential rejected"
                    );
                },
                Err(HandshakeError::Fatal(err)) => return Err(err),
            }
        }
        Err(ConnectError::AuthFailed { attempts: total })
    }

    async fn handshake(
        &self,
        token: Option<&Secret<String>>,
    ) -> Result<(HelloOk, FrameSink, FrameStream), HandshakeError> {
        match tokio::time::timeout(
            self.inner.config.timeouts.connect(),
            self.handshake_once(token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Fatal(ConnectError::Timeout)),
        }
    }

    /// Open a link and run the `connect` exchange on it. Events that arrive
    /// before the response are skipped.
    async fn handshake_once(
        &self,
        token: Option<&Secret<String>>,
    ) -> Result<(HelloOk, FrameSink, FrameStream), HandshakeError> {
        let (mut sink, mut stream) = self
            .inner
            .transport
            .connect(&self.inner.url)
            .await
            .map_err(|e| HandshakeError::Fatal(e.into()))?;

        let id = Uuid::new_v4().to_string();
        let mut params = ConnectParams::new(self.inner.client.clone())
            .with_token(token.map(|t| t.expose_secret().clone()));
        params.role = Some(self.inner.config.gateway.role.clone());
        params.scopes = Some(self.inner.config.gateway.scopes.clone());
        let frame = RequestFrame::new(&id, methods::CONNECT, Some(json!(params)));
        let text = serde_json::to_string(&frame)
            .map_err(|e| HandshakeError::Fatal(ConnectError::Protocol(e.to_string())))?;
        sink.send(text)
            .await
            .map_err(|e| HandshakeError::Fatal(e.into()))?;

        loop {
            let text = match stream.next().await {
                Some(Ok(text)) => text,
                Some(Err(e)) if e.is_unauthorized() => {
                    return Err(HandshakeError::Unauthorized(e.to_string()));
                },
                Some(Err(e)) => return Err(HandshakeError::Fatal(e.into())),
                None => {
                    return Err(HandshakeError::Fatal(
                        TransportError::Closed { reason: None }.into(),
                    ));
                },
            };
            match GatewayFrame::parse(&text) {
                Ok(GatewayFrame::Response(res)) if res.id == id => {
                    if res.ok {
                        let hello: HelloOk =
                            serde_json::from_value(res.payload.unwrap_or_default()).map_err(
                                |e| HandshakeError::Fatal(ConnectError::Protocol(e.to_string())),
                            )?;
                        return Ok((hello, sink, stream));
                    }
                    let err = res.error.unwrap_or_else(|| {
                        ErrorShape::new(error_codes::UNAVAILABLE, "connect rejected")
                    });
                    return Err(if err.is_unauthorized() {
                        HandshakeError::Unauthorized(err.to_string())
                    } else {
                        HandshakeError::Fatal(ConnectError::Rejected(err))
                    });
                },
                Ok(GatewayFrame::Event(event)) => {
                    trace!(event = %event.event, "connection: skipping event before handshake");
                },
                Ok(_) => {},
                Err(e) => warn!(error = %e, "connection: malformed frame during handshake"),
            }
        }
    }

    /// Install a freshly handshaken link and start its tasks.
    fn attach(&self, sink: FrameSink, stream: FrameStream, hello: &HelloOk) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = self.session_token().child_token();
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let previous = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Link {
                outbound,
                cancel: cancel.clone(),
                generation,
            });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        *self.inner.peer.lock().unwrap_or_else(|e| e.into_inner()) = hello
            .health()
            .and_then(|h| h.pid)
            .map(|pid| (generation, pid));

        self.inner
            .tasks
            .spawn(self.clone().write_loop(sink, rx, cancel.clone(), generation));
        self.inner
            .tasks
            .spawn(self.clone().read_loop(stream, cancel.clone(), generation));
        self.inner
            .tasks
            .spawn(self.clone().health_loop(cancel, generation));
    }

    // ── Requests ────────────────────────────────────────────────────────────

    /// Send a request and wait for its response.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.send_with_timeout(method, params, self.inner.config.timeouts.request())
            .await
    }

    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let outbound = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(CallError::NotConnected)?;

        let id = Uuid::new_v4().to_string();
        let text = serde_json::to_string(&RequestFrame::new(&id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: &id,
        };

        if outbound.send(text).await.is_err() {
            return Err(CallError::ConnectionClosed);
        }
        debug!(method, id = %id, "connection: request sent");

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(CallError::Timeout {
                method: method.to_string(),
            }),
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Ok(Ok(res)) if res.ok => Ok(res.payload.unwrap_or(Value::Null)),
            Ok(Ok(res)) => Err(CallError::Remote(res.error.unwrap_or_else(|| {
                ErrorShape::new(error_codes::INTERNAL, "request failed without detail")
            }))),
        }
    }

    async fn announce_presence(&self) {
        let params = json!({
            "instanceId": self.inner.client.instance_id,
            "clientId": self.inner.client.id,
            "platform": self.inner.client.platform,
            "mode": self.inner.client.mode,
        });
        if let Err(e) = self.send(methods::SYSTEM_PRESENCE, Some(params)).await {
            warn!(error = %e, "connection: presence announcement failed");
        }
    }

    // ── Link tasks ──────────────────────────────────────────────────────────

    async fn write_loop(
        self,
        mut sink: FrameSink,
        mut rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = sink.send(text).await {
                            warn!(error = %e, generation, "connection: write failed");
                            self.on_link_lost(generation, &e.to_string());
                            return;
                        }
                    },
                    None => break,
                },
            }
        }
        let _ = sink.close().await;
    }

    async fn read_loop(self, mut stream: FrameStream, cancel: CancellationToken, generation: u64) {
        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                next = stream.next() => match next {
                    Some(Ok(text)) => self.route(&text, generation),
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                },
            }
        };
        self.on_link_lost(generation, &reason);
    }

    fn route(&self, text: &str, generation: u64) {
        let frame = match GatewayFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "connection: dropping malformed frame");
                return;
            },
        };
        match frame {
            GatewayFrame::Response(res) => match self.inner.pending.remove(&res.id) {
                Some((_, tx)) => {
                    let _ = tx.send(res);
                },
                None => debug!(id = %res.id, "connection: response for unknown request"),
            },
            GatewayFrame::Event(event) => match event.event.as_str() {
                events::AGENT => {
                    let Some(payload) = event.payload else {
                        debug!("connection: agent event without payload");
                        return;
                    };
                    match AgentEvent::decode(&payload) {
                        Ok(agent_event) => {
                            trace!(
                                run_id = %agent_event.run_id,
                                seq = ?agent_event.seq,
                                stream = agent_event.kind.stream_name(),
                                "connection: agent event"
                            );
                            self.inner.agent_events.publish(agent_event);
                        },
                        Err(e) => debug!(error = %e, "connection: dropping agent event"),
                    }
                },
                events::HEALTH => {
                    if let Some(payload) = event.payload
                        && let Ok(snapshot) = serde_json::from_value::<HealthSnapshot>(payload)
                    {
                        self.observe_peer(generation, snapshot.pid);
                    }
                },
                events::SHUTDOWN => info!("connection: gateway announced shutdown"),
                other => trace!(event = other, "connection: ignoring event"),
            },
            GatewayFrame::Request(req) => {
                debug!(method = %req.method, "connection: ignoring gateway request");
            },
        }
    }

    async fn health_loop(self, cancel: CancellationToken, generation: u64) {
        let mut ticker = tokio::time::interval(self.inner.config.health.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the handshake already reported.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            match self.send(methods::HEALTH, None).await {
                Ok(payload) => match serde_json::from_value::<HealthSnapshot>(payload) {
                    Ok(snapshot) => self.observe_peer(generation, snapshot.pid),
                    Err(e) => debug!(error = %e, "connection: unreadable health payload"),
                },
                Err(e) => debug!(error = %e, "connection: health poll failed"),
            }
        }
    }

    /// Compare the gateway pid against the one last seen on this link. The
    /// first pid on a link is only recorded.
    fn observe_peer(&self, generation: u64, pid: Option<u32>) {
        let Some(pid) = pid else {
            return;
        };
        if generation != self.inner.generation.load(Ordering::Acquire) {
            return;
        }
        let previous = {
            let mut peer = self.inner.peer.lock().unwrap_or_else(|e| e.into_inner());
            match *peer {
                Some((seen_generation, seen_pid)) if seen_generation == generation => {
                    *peer = Some((generation, pid));
                    (seen_pid != pid).then_some(seen_pid)
                },
                _ => {
                    *peer = Some((generation, pid));
                    None
                },
            }
        };
        if let Some(previous) = previous {
            warn!(previous, current = pid, "connection: gateway restarted, reconnecting");
            self.emit(ConnectionEvent::PeerRestarted {
                previous,
                current: pid,
            });
            self.on_link_lost(generation, "gateway restarted");
        }
    }

    // ── Loss and reconnect ──────────────────────────────────────────────────

    fn on_link_lost(&self, generation: u64, reason: &str) {
        let link = {
            let mut guard = self.inner.link.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(link) if link.generation == generation => guard.take(),
                _ => None,
            }
        };
        // Already replaced or intentionally dropped.
        let Some(link) = link else {
            return;
        };
        link.cancel.cancel();
        self.fail_pending();
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(reason, generation, "connection: link lost");
        self.emit(ConnectionEvent::Disconnected);
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancel = self.session_token();
        self.inner.tasks.spawn(self.clone().reconnect_loop(cancel));
    }

    async fn reconnect_loop(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(&self.inner.config.reconnect);
        let outcome = loop {
            let Some(delay) = backoff.next_delay() else {
                break ReconnectOutcome::Exhausted(backoff.attempt());
            };
            let attempt = backoff.attempt();
            self.set_live_state(&cancel, ConnectionState::Reconnecting { attempt });
            debug!(attempt, delay_ms = delay.as_millis() as u64, "connection: reconnect scheduled");

            tokio::select! {
                () = cancel.cancelled() => break ReconnectOutcome::Cancelled,
                () = tokio::time::sleep(delay) => {},
            }
            let result = tokio::select! {
                () = cancel.cancelled() => break ReconnectOutcome::Cancelled,
                result = self.establish() => result,
            };
            match result {
                Ok(_) => break ReconnectOutcome::Connected,
                Err(ConnectError::AuthFailed { attempts }) => {
                    break ReconnectOutcome::AuthFailed(attempts);
                },
                Err(ConnectError::Shutdown) => break ReconnectOutcome::Cancelled,
                Err(e) => warn!(attempt, error = %e, "connection: reconnect attempt failed"),
            }
        };
        self.inner.reconnecting.store(false, Ordering::Release);

        match outcome {
            _ if cancel.is_cancelled() => {
                debug!("connection: reconnect superseded");
            },
            ReconnectOutcome::Connected => {
                if !self.has_link() {
                    // Lost again before we got here; go round once more.
                    self.spawn_reconnect();
                    return;
                }
                self.set_live_state(&cancel, ConnectionState::Connected);
                self.announce_presence().await;
                info!(attempts = backoff.attempt(), "connection: reconnected");
                self.emit(ConnectionEvent::Reconnected);
            },
            ReconnectOutcome::AuthFailed(attempts) => {
                error!(attempts, "connection: credentials rejected during reconnect");
                self.set_live_state(
                    &cancel,
                    ConnectionState::Failed(FailureReason::AuthFailed { attempts }),
                );
                self.emit(ConnectionEvent::AuthFailed { attempts });
            },
            ReconnectOutcome::Exhausted(attempts) => {
                error!(attempts, "connection: giving up on reconnect");
                self.set_live_state(
                    &cancel,
                    ConnectionState::Failed(FailureReason::ReconnectExhausted { attempts }),
                );
            },
            ReconnectOutcome::Cancelled => {
                debug!("connection: reconnect cancelled");
            },
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Close the link on purpose. No reconnect follows; pending calls fail
    /// with [`CallError::ConnectionClosed`].
    pub fn disconnect(&self) {
        self.renew_session();
        let had_link = self.drop_link();
        self.set_state(ConnectionState::Disconnected);
        if had_link {
            info!(url = %self.inner.url, "connection: disconnected");
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Disconnect, stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.disconnect();
        self.inner.shutdown.cancel();
        self.inner.agent_events.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("connection: shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn drop_link(&self) -> bool {
        let link = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let had_link = link.is_some();
        if let Some(link) = link {
            link.cancel.cancel();
        }
        self.fail_pending();
        had_link
    }

    fn has_link(&self) -> bool {
        self.inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with `ConnectionClosed`.
        self.inner.pending.clear();
    }

    fn session_token(&self) -> CancellationToken {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel the current session (links and reconnect loop) and start a
    /// fresh one.
    fn renew_session(&self) {
        let mut session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
        session.cancel();
        *session = self.inner.shutdown.child_token();
    }

    fn set_state(&self, next: ConnectionState) {
        self.update_state(None, next);
    }

    /// Like `set_state`, but a no-op once `session` is cancelled. The check
    /// happens under the watch lock, so a concurrent `disconnect` always
    /// has the last word.
    fn set_live_state(&self, session: &CancellationToken, next: ConnectionState) {
        self.update_state(Some(session), next);
    }

    fn update_state(&self, session: Option<&CancellationToken>, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if session.is_some_and(CancellationToken::is_cancelled) || *current == next {
                return false;
            }
            info!(from = ?current, to = ?next, "connection: state change");
            *current = next;
            true
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn failure_reason(err: &ConnectError) -> FailureReason {
    match err {
        ConnectError::AuthFailed { attempts } => FailureReason::AuthFailed {
            attempts: *attempts,
        },
        ConnectError::Rejected(shape) => FailureReason::Protocol(shape.to_string()),
        ConnectError::Protocol(msg) => FailureReason::Protocol(msg.clone()),
        ConnectError::Transport(_) | ConnectError::Timeout | ConnectError::Shutdown => {
            FailureReason::Transport(err.to_string())
        },
    }
}

#[async_trait]
impl RunWaiter for ConnectionController {
    async fn wait_run(&self, run_id: &str) -> Result<RunWaitStatus, CallError> {
        let payload = self
            .send_with_timeout(
                methods::AGENT_WAIT,
                Some(json!({ "runId": run_id, "timeoutMs": 0 })),
                self.inner.config.timeouts.wait(),
            )
            .await?;
        let result: RunWaitResult = serde_json::from_value(payload)?;
        Ok(result.status)
    }
}
