// ABOUTME: In-process connector used by tests to stand in for the server side.
// ABOUTME: Each connect hands a MemoryPeer to the MemoryServer; dropping the peer drops the connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use buildwire_core::ProtocolError;
use buildwire_proto::{decode, encode, Envelope, MessageType};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ConnectionError;
use crate::transport::{Connection, Connector, FrameSink, FrameSource};

/// Client side of the in-memory transport.
#[derive(Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<MemoryPeer>,
    failures: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

/// Accepts connections opened through the paired [`MemoryConnector`].
pub struct MemoryServer {
    accept: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept: tx,
            failures: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        };
        (connector, MemoryServer { accept: rx })
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ConnectionError::ConnectionFailed(
                "injected connect failure".to_string(),
            ));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            tx: to_client,
            rx: from_client,
        };
        self.accept
            .send(peer)
            .map_err(|_| ConnectionError::ConnectionFailed("memory server dropped".to_string()))?;

        Ok(Connection::new(
            MemorySink {
                tx: Some(to_server),
            },
            MemorySource { rx: from_server },
        ))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryServer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept.recv().await
    }
}

/// Server end of one in-memory connection.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryPeer {
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.tx
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionLost("client hung up".to_string()))
    }

    pub fn send_envelope(&self, env: &Envelope) -> Result<(), ProtocolError> {
        self.send_frame(encode(env)?)
    }

    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next decodable envelope, heartbeats included.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.rx.recv().await?;
            match decode(&frame) {
                Ok(env) => return Some(env),
                Err(e) => warn!(error = %e, "memory peer dropped undecodable frame"),
            }
        }
    }

    /// Next envelope that is not a heartbeat.
    pub async fn recv_message(&mut self) -> Option<Envelope> {
        loop {
            let env = self.recv_envelope().await?;
            if env.kind != MessageType::Heartbeat {
                return Some(env);
            }
        }
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        let tx = self.tx.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(frame)
            .map_err(|_| ConnectionError::ConnectionLost("peer closed".to_string()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, ConnectionError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildwire_proto::Actor;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut server) = MemoryConnector::new();
        let (mut sink, mut source) = connector.connect().await.unwrap().split();
        let mut peer = server.accept().await.unwrap();

        sink.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(peer.recv_frame().await.unwrap(), b"hello".to_vec());

        peer.send_frame(b"world".to_vec()).unwrap();
        assert_eq!(source.recv().await.unwrap().unwrap(), b"world".to_vec());
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let (connector, mut server) = MemoryConnector::new();
        connector.fail_next(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
        assert!(server.accept().await.is_some());
    }

    #[tokio::test]
    async fn test_dropping_peer_ends_source() {
        let (connector, mut server) = MemoryConnector::new();
        let (mut sink, mut source) = connector.connect().await.unwrap().split();
        drop(server.accept().await.unwrap());

        assert!(source.recv().await.is_none());
        assert!(matches!(
            sink.send(b"x".to_vec()).await,
            Err(ConnectionError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_message_skips_heartbeats() {
        let (connector, mut server) = MemoryConnector::new();
        let (mut sink, _source) = connector.connect().await.unwrap().split();
        let mut peer = server.accept().await.unwrap();

        let question = Envelope::start(Actor::User, MessageType::QuestionToAi);
        sink.send(encode(&Envelope::heartbeat("s", Actor::User)).unwrap())
            .await
            .unwrap();
        sink.send(b"{broken".to_vec()).await.unwrap();
        sink.send(encode(&question).unwrap()).await.unwrap();

        let got = peer.recv_message().await.unwrap();
        assert_eq!(got.message_id, question.message_id);
    }
}
