use crate::core::errors::ExchangeError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, instrument};

type BoxedSink = Pin<Box<dyn Sink<Message, Error = ExchangeError> + Send>>;
type BoxedStream = Pin<Box<dyn Stream<Item = Result<Message, ExchangeError>> + Send>>;

/// One open transport, split into its write and read halves.
///
/// The streaming manager owns it exclusively and drops it on every
/// reconnect.
pub struct WsConnection {
    sink: BoxedSink,
    stream: BoxedStream,
}

impl WsConnection {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Message, Error = ExchangeError> + Send + 'static,
        R: Stream<Item = Result<Message, ExchangeError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
        self.sink.send(message).await
    }

    /// Next raw frame, `None` once the peer has gone away.
    pub async fn next(&mut self) -> Option<Result<Message, ExchangeError>> {
        self.stream.next().await
    }

    /// Best-effort close frame; the connection is unusable afterwards.
    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection").finish_non_exhaustive()
    }
}

/// Opens transports for the streaming manager. Tests swap in scripted connectors.
#[async_trait]
pub trait WsConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<WsConnection, ExchangeError>;
}

/// tokio-tungstenite connector with a bounded handshake.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&self, url: &str) -> Result<WsConnection, ExchangeError> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ExchangeError::Timeout("WebSocket connection timeout".to_string()))?
            .map_err(|e| ExchangeError::Network(format!("WebSocket connection failed: {}", e)))?;
        debug!("websocket transport open");

        let (write, read) = ws_stream.split();
        Ok(WsConnection::new(
            write.sink_map_err(ExchangeError::from),
            read.map(|frame| frame.map_err(ExchangeError::from)),
        ))
    }
}
