//! In-memory gateway used by the integration tests.
//!
//! Implements [`Transport`] over futures channels and answers the handful of
//! methods the client issues on its own (`connect`, `health`, `agent.wait`,
//! `system-presence`) plus an `echo` method for correlation tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt, channel::mpsc},
    secrecy::Secret,
    serde_json::{Value, json},
    tether_client::{
        CredentialSources, Transport, TransportError,
        transport::{FrameSink, FrameStream},
    },
    tether_config::ClientConfig,
    tether_protocol::{
        ErrorShape, EventFrame, GatewayFrame, ResponseFrame, error_codes, events, methods,
    },
    url::Url,
};

pub const LOOPBACK_URL: &str = "ws://127.0.0.1:18789";
pub const REMOTE_URL: &str = "wss://gateway.example.com";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_client=debug")
        .with_test_writer()
        .try_init();
}

/// Short delays everywhere so reconnect tests finish quickly. Health polling
/// is effectively off unless a test turns it on.
pub fn test_config(url: &str) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.gateway.url = url.into();
    config.reconnect.initial_delay_ms = 10;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.max_attempts = 4;
    config.reconnect.jitter = 0.0;
    config.timeouts.connect_ms = 2_000;
    config.timeouts.request_ms = 2_000;
    config.timeouts.wait_ms = 500;
    config.health.interval_secs = 3_600;
    config
}

pub fn with_token(mut config: ClientConfig, token: &str) -> ClientConfig {
    config.gateway.token = Some(Secret::new(token.to_string()));
    config
}

/// Credential sources returning fixed values.
pub fn sources(
    device: Option<&str>,
    paired: Option<&str>,
    legacy: Option<&str>,
    launch_agent: Option<&str>,
) -> CredentialSources {
    fn fixed(value: Option<&str>) -> impl Fn() -> Option<String> + Send + Sync + 'static {
        let value = value.map(String::from);
        move || value.clone()
    }
    CredentialSources::none()
        .with_device_auth(fixed(device))
        .with_paired_device(fixed(paired))
        .with_legacy_config(fixed(legacy))
        .with_launch_agent(fixed(launch_agent))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub fn agent_payload(run_id: &str, seq: Option<u64>, stream: &str, data: Value) -> Value {
    let mut payload = json!({
        "runId": run_id,
        "stream": stream,
        "ts": 1_700_000_000_000u64,
        "data": data,
    });
    if let Some(seq) = seq {
        payload["seq"] = json!(seq);
    }
    payload
}

// ── Gateway ─────────────────────────────────────────────────────────────────

type ClientTx = mpsc::UnboundedSender<Result<String, TransportError>>;

#[derive(Default)]
struct State {
    accepted: Mutex<HashSet<String>>,
    allow_anonymous: AtomicBool,
    refuse: AtomicBool,
    pid: AtomicU32,
    next_link: AtomicUsize,
    links: Mutex<HashMap<usize, ClientTx>>,
    authed: Mutex<HashSet<usize>>,
    presented: Mutex<Vec<Option<String>>>,
    requests: Mutex<Vec<String>>,
    waited: Mutex<Vec<String>>,
    run_status: Mutex<HashMap<String, String>>,
}

#[derive(Clone)]
pub struct FakeGateway {
    state: Arc<State>,
}

impl FakeGateway {
    pub fn new() -> Self {
        let gateway = Self {
            state: Arc::new(State::default()),
        };
        gateway.state.pid.store(100, Ordering::SeqCst);
        gateway
    }

    pub fn accept(self, token: &str) -> Self {
        self.state.accepted.lock().unwrap().insert(token.into());
        self
    }

    pub fn anonymous(self) -> Self {
        self.state.allow_anonymous.store(true, Ordering::SeqCst);
        self
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn reject_all(&self) {
        self.state.accepted.lock().unwrap().clear();
        self.state.allow_anonymous.store(false, Ordering::SeqCst);
    }

    /// Refuse new links at the transport level.
    pub fn refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_pid(&self, pid: u32) {
        self.state.pid.store(pid, Ordering::SeqCst);
    }

    pub fn set_run_status(&self, run_id: &str, status: &str) {
        self.state
            .run_status
            .lock()
            .unwrap()
            .insert(run_id.into(), status.into());
    }

    /// Tokens presented in `connect` requests, in order.
    pub fn presented(&self) -> Vec<Option<String>> {
        self.state.presented.lock().unwrap().clone()
    }

    /// Method names received after the handshake, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.requests().iter().filter(|m| *m == method).count()
    }

    pub fn waited(&self) -> Vec<String> {
        self.state.waited.lock().unwrap().clone()
    }

    pub fn link_count(&self) -> usize {
        self.state.next_link.load(Ordering::SeqCst)
    }

    pub fn live_links(&self) -> usize {
        self.state.authed.lock().unwrap().len()
    }

    /// Push an event to every authenticated link.
    pub fn push(&self, event: &str, payload: Value) {
        let text = serde_json::to_string(&EventFrame::new(event, payload)).unwrap();
        let authed = self.state.authed.lock().unwrap().clone();
        let links = self.state.links.lock().unwrap();
        for id in authed {
            if let Some(tx) = links.get(&id) {
                let _ = tx.unbounded_send(Ok(text.clone()));
            }
        }
    }

    pub fn push_agent(&self, payload: Value) {
        self.push(events::AGENT, payload);
    }

    /// Close every link from the gateway side.
    pub fn drop_links(&self) {
        self.state.links.lock().unwrap().clear();
        self.state.authed.lock().unwrap().clear();
    }

    fn reply(state: &State, link: usize, frame: &ResponseFrame) {
        let text = serde_json::to_string(frame).unwrap();
        if let Some(tx) = state.links.lock().unwrap().get(&link) {
            let _ = tx.unbounded_send(Ok(text));
        }
    }

    async fn serve(state: Arc<State>, link: usize, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.next().await {
            let Ok(GatewayFrame::Request(req)) = GatewayFrame::parse(&text) else {
                continue;
            };
            let params = req.params.clone().unwrap_or(Value::Null);

            if req.method == methods::CONNECT {
                let token = params
                    .pointer("/auth/token")
                    .and_then(Value::as_str)
                    .map(String::from);
                state.presented.lock().unwrap().push(token.clone());
                let accepted = match &token {
                    Some(token) => state.accepted.lock().unwrap().contains(token),
                    None => state.allow_anonymous.load(Ordering::SeqCst),
                };
                if !accepted {
                    let error = ErrorShape::new(error_codes::UNAUTHORIZED, "unauthorized");
                    Self::reply(&state, link, &ResponseFrame::err(&req.id, error));
                    continue;
                }
                state.authed.lock().unwrap().insert(link);
                let pid = state.pid.load(Ordering::SeqCst);
                let hello = json!({
                    "type": "hello-ok",
                    "protocol": 3,
                    "server": { "version": "test", "connId": format!("conn-{link}") },
                    "snapshot": { "health": { "pid": pid } },
                });
                Self::reply(&state, link, &ResponseFrame::ok(&req.id, hello));
                continue;
            }

            state.requests.lock().unwrap().push(req.method.clone());
            let payload = match req.method.as_str() {
                methods::HEALTH => json!({ "pid": state.pid.load(Ordering::SeqCst), "uptime": 1.0 }),
                methods::AGENT_WAIT => {
                    let run_id = params["runId"].as_str().unwrap_or_default().to_string();
                    state.waited.lock().unwrap().push(run_id.clone());
                    let status = state
                        .run_status
                        .lock()
                        .unwrap()
                        .get(&run_id)
                        .cloned()
                        .unwrap_or_else(|| "timeout".into());
                    json!({ "runId": run_id, "status": status })
                },
                methods::SYSTEM_PRESENCE => json!({}),
                "echo" => {
                    let delay = params["delayMs"].as_u64().unwrap_or(0);
                    let state = Arc::clone(&state);
                    let id = req.id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        Self::reply(&state, link, &ResponseFrame::ok(id, params));
                    });
                    continue;
                },
                other => {
                    let error = ErrorShape::new(error_codes::UNKNOWN_METHOD, other);
                    Self::reply(&state, link, &ResponseFrame::err(&req.id, error));
                    continue;
                },
            };
            Self::reply(&state, link, &ResponseFrame::ok(&req.id, payload));
        }
        state.links.lock().unwrap().remove(&link);
        state.authed.lock().unwrap().remove(&link);
    }
}

#[async_trait]
impl Transport for FakeGateway {
    async fn connect(&self, _url: &Url) -> Result<(FrameSink, FrameStream), TransportError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::message("connection refused"));
        }
        let link = self.state.next_link.fetch_add(1, Ordering::SeqCst);
        let (client_tx, client_rx) = mpsc::unbounded();
        let (server_tx, server_rx) = mpsc::unbounded::<String>();
        self.state.links.lock().unwrap().insert(link, client_tx);
        tokio::spawn(Self::serve(Arc::clone(&self.state), link, server_rx));

        let sink = server_tx.sink_map_err(|_| TransportError::message("gateway gone"));
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }
}
