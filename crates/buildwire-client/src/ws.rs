// ABOUTME: WebSocket connector over tokio-tungstenite.
// ABOUTME: Envelopes travel as text frames; binary frames are accepted inbound.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::error::ConnectionError;
use crate::transport::{Connection, Connector, FrameSink, FrameSource};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self, ConnectionError> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConnectionError::InvalidAddress(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConnectionError::InvalidAddress(format!(
                "URL has no host: {url}"
            )));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, ConnectionError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket connected");

        let (writer, reader) = stream.split();
        Ok(Connection::new(WsSink(writer), WsSource(reader)))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        let text = String::from_utf8(frame)
            .map_err(|e| ConnectionError::WebSocket(format!("frame is not UTF-8: {e}")))?;
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, ConnectionError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().as_bytes().to_vec())),
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                // tungstenite answers pings itself on the next write
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                    trace!("control frame");
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
