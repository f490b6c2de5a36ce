// ABOUTME: Transport abstraction: a Connector yields a Connection split into sink and source halves.
// ABOUTME: Frames are raw envelope bytes; WebSocket and in-memory transports implement these traits.

use async_trait::async_trait;

use crate::error::ConnectionError;

/// Sending half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame. Returns once the transport accepted it.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError>;

    /// Close the connection politely. Errors are ignored.
    async fn close(&mut self);
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, an error, or `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, ConnectionError>>;
}

/// One established physical connection.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    /// Split into sink and source.
    pub fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

/// Opens connections to the server. Called again for every reconnection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ConnectionError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}
