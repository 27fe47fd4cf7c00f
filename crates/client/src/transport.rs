//! Text-frame transport seam.
//!
//! The controller only ever sees strings going out and strings (or a close
//! reason) coming in, which lets tests swap the socket for in-memory channels.

use std::pin::Pin;

use {
    async_trait::async_trait,
    futures::{Sink, SinkExt, Stream, StreamExt, future},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::debug,
    url::Url,
};

use crate::error::TransportError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one link. The stream ends (or yields [`TransportError::Closed`])
    /// when the peer goes away.
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// WebSocket transport over `tokio-tungstenite`. Binary frames are ignored;
/// ping/pong is handled by tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream), TransportError> {
        debug!(url = %url, "transport: opening websocket");
        let (ws, _response) = connect_async(url.as_str()).await?;
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(TransportError::from)
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => Some(Err(TransportError::Closed {
                    reason: frame
                        .map(|f| f.reason.as_str().to_owned())
                        .filter(|r| !r.is_empty()),
                })),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
