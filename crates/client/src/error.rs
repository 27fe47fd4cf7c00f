use tether_protocol::ErrorShape;

/// Failure of the underlying socket. Always worth a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("connection closed: {}", reason.as_deref().unwrap_or("no reason given"))]
    Closed { reason: Option<String> },
    #[error("{message}")]
    Message { message: String },
}

impl TransportError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// A close frame whose reason says the credential was refused.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Closed {
                reason: Some(reason),
            } => reason.to_ascii_lowercase().contains("unauthorized"),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Every candidate credential was refused.
    #[error("gateway rejected all {attempts} credential(s)")]
    AuthFailed { attempts: usize },
    /// The handshake failed for a reason other than the credential.
    #[error("gateway rejected connect: {0}")]
    Rejected(ErrorShape),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("client is shut down")]
    Shutdown,
}

impl ConnectError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("not connected")]
    NotConnected,
    #[error("`{method}` timed out")]
    Timeout { method: String },
    #[error("gateway error: {0}")]
    Remote(ErrorShape),
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// A resync poll that could not be completed. Logged, never fatal; the run
/// stays pending and is retried on the next refresh.
#[derive(Debug, thiserror::Error)]
pub enum ResyncError {
    #[error("gap resync failed for run {run_id}: {source}")]
    GapResyncFailure {
        run_id: String,
        #[source]
        source: CallError,
    },
}
