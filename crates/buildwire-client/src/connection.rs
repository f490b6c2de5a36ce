// ABOUTME: Connection manager: one logical connection with heartbeat, liveness and reconnection.
// ABOUTME: Replays unanswered requests after reconnecting and publishes ConnectionEvents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildwire_core::{Backoff, BuildwireConfig, ProtocolEngine, ProtocolError, Transmit};
use buildwire_proto::{decode, encode, Envelope, MessageType};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ConnectionError;
use crate::transport::{Connection, Connector, FrameSink};

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

/// Timing knobs for one connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Send a heartbeat after this much outbound silence.
    pub heartbeat_interval: Duration,
    /// Declare the connection lost after this much inbound silence.
    pub liveness_timeout: Duration,
    /// Bound on a single connect attempt and on a single frame write.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    /// Consecutive failed reconnects before giving up (None retries forever).
    pub max_attempts: Option<u32>,
}

impl ConnectionSettings {
    pub fn from_config(config: &BuildwireConfig) -> Self {
        Self {
            heartbeat_interval: config.connection.heartbeat_interval(),
            liveness_timeout: config.connection.liveness_timeout(),
            connect_timeout: config.connection.connect_timeout(),
            backoff: config.reconnect.backoff(),
            max_attempts: config.reconnect.max_attempts,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&BuildwireConfig::default())
    }
}

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A connection is up. `attempt` is 0 for the first connect, else the reconnect attempt.
    Connected { attempt: u32 },
    Lost { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Requests re-sent after reconnecting.
    Replayed { count: usize },
    Abandoned { attempts: u32 },
    Closed,
}

struct OutboundFrame {
    frame: Vec<u8>,
    ack: oneshot::Sender<Result<(), ConnectionError>>,
}

/// Cloneable sending side of a [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<OutboundFrame>,
    events: broadcast::Sender<ConnectionEvent>,
    connected: watch::Receiver<bool>,
    session_id: Arc<str>,
}

impl ConnectionHandle {
    /// Write one frame on the current connection.
    ///
    /// Fails fast with `NotConnected` while the manager is between connections and
    /// with `ConnectionLost` if the connection drops before the frame is written.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(OutboundFrame { frame, ack })
            .await
            .map_err(|_| ConnectionError::StreamClosed)?;
        rx.await.map_err(|_| ConnectionError::StreamClosed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolve once a connection is up; fails if the manager has stopped.
    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        let mut connected = self.connected.clone();
        connected
            .wait_for(|up| *up)
            .await
            .map(|_| ())
            .map_err(|_| ConnectionError::StreamClosed)
    }

    /// Identifier carried as `threadId` on this session's heartbeats.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transmit for ConnectionHandle {
    async fn transmit(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        Ok(self.send_frame(frame).await?)
    }
}

enum DriveEnd {
    Shutdown,
    Lost(String),
}

/// Owns the physical connection and everything timed around it.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    engine: Arc<ProtocolEngine>,
    inbound: mpsc::Sender<Envelope>,
    outbound: mpsc::Receiver<OutboundFrame>,
    events: broadcast::Sender<ConnectionEvent>,
    connected: watch::Sender<bool>,
    session_id: Arc<str>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Inbound envelopes other than heartbeats are forwarded to `inbound`.
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        engine: Arc<ProtocolEngine>,
        inbound: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let (tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connected, connected_rx) = watch::channel(false);
        let session_id: Arc<str> = uuid::Uuid::new_v4().to_string().into();

        let handle = ConnectionHandle {
            tx,
            events: events.clone(),
            connected: connected_rx,
            session_id: session_id.clone(),
        };
        let manager = Self {
            settings,
            connector,
            engine,
            inbound,
            outbound,
            events,
            connected,
            session_id,
            shutdown,
        };
        (manager, handle)
    }

    /// Run until shutdown or until reconnection is abandoned.
    ///
    /// `ReconnectAbandoned` is the only error returned.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(
            server = %self.connector.describe(),
            session_id = %self.session_id,
            "connection manager starting"
        );

        let Some(mut connection) = self.establish(true).await? else {
            self.closed();
            return Ok(());
        };

        loop {
            match self.drive(connection).await {
                DriveEnd::Shutdown => {
                    self.closed();
                    return Ok(());
                }
                DriveEnd::Lost(reason) => {
                    warn!(reason = %reason, "connection lost");
                    self.connected.send_replace(false);
                    self.emit(ConnectionEvent::Lost {
                        reason: reason.clone(),
                    });
                    self.fail_in_flight(&reason);

                    connection = match self.establish(false).await? {
                        Some(c) => c,
                        None => {
                            self.closed();
                            return Ok(());
                        }
                    };
                }
            }
        }
    }

    fn closed(&self) {
        self.connected.send_replace(false);
        info!(session_id = %self.session_id, "connection manager closed");
        self.emit(ConnectionEvent::Closed);
    }

    fn emit(&self, event: ConnectionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Connect, backing off between failures. `Ok(None)` means shutdown was requested.
    async fn establish(&mut self, immediate: bool) -> Result<Option<Connection>, ConnectionError> {
        if immediate {
            match self.try_connect().await {
                Ok(connection) => {
                    info!("connected");
                    self.connected.send_replace(true);
                    self.emit(ConnectionEvent::Connected { attempt: 0 });
                    return Ok(Some(connection));
                }
                Err(e) => warn!(error = %e, "initial connect failed"),
            }
        }

        let mut attempt: u32 = 0;
        loop {
            if let Some(max) = self.settings.max_attempts {
                if attempt >= max {
                    warn!(attempts = attempt, "giving up on reconnection");
                    self.emit(ConnectionEvent::Abandoned { attempts: attempt });
                    return Err(ConnectionError::ReconnectAbandoned { attempts: attempt });
                }
            }
            attempt += 1;
            let delay = self.settings.backoff.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });

            if !self.wait_rejecting(delay).await {
                return Ok(None);
            }

            match self.try_connect().await {
                Ok(connection) => {
                    info!(attempt, "reconnected");
                    self.connected.send_replace(true);
                    self.emit(ConnectionEvent::Connected { attempt });
                    return Ok(Some(connection));
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
    }

    async fn try_connect(&self) -> Result<Connection, ConnectionError> {
        match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectionFailed(format!(
                "connect timed out after {:?}",
                self.settings.connect_timeout
            ))),
        }
    }

    /// Sleep for `delay`, rejecting sends with `NotConnected` meanwhile.
    /// Returns false if the manager should stop.
    async fn wait_rejecting(&mut self, delay: Duration) -> bool {
        let deadline = after(Instant::now(), delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = sleep_until(deadline) => return true,
                frame = self.outbound.recv() => match frame {
                    Some(OutboundFrame { ack, .. }) => {
                        let _ = ack.send(Err(ConnectionError::NotConnected));
                    }
                    None => return false,
                },
            }
        }
    }

    /// Fail every send queued for the connection that just dropped.
    fn fail_in_flight(&mut self, reason: &str) {
        let mut failed = 0usize;
        while let Ok(OutboundFrame { ack, .. }) = self.outbound.try_recv() {
            let _ = ack.send(Err(ConnectionError::ConnectionLost(reason.to_string())));
            failed += 1;
        }
        if failed > 0 {
            debug!(failed, "failed in-flight sends");
        }
    }

    async fn drive(&mut self, connection: Connection) -> DriveEnd {
        let (mut sink, mut source) = connection.split();
        let write_timeout = self.settings.connect_timeout;

        if let Err(reason) = self.replay(sink.as_mut(), write_timeout).await {
            return DriveEnd::Lost(reason);
        }

        let mut last_inbound = Instant::now();
        let mut last_outbound = Instant::now();

        loop {
            let heartbeat_at = after(last_outbound, self.settings.heartbeat_interval);
            let stale_at = after(last_inbound, self.settings.liveness_timeout);

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    sink.close().await;
                    return DriveEnd::Shutdown;
                }

                incoming = source.recv() => match incoming {
                    Some(Ok(frame)) => {
                        last_inbound = Instant::now();
                        self.accept(&frame).await;
                    }
                    Some(Err(e)) => return DriveEnd::Lost(e.to_string()),
                    None => return DriveEnd::Lost("closed by peer".to_string()),
                },

                outgoing = self.outbound.recv() => match outgoing {
                    Some(OutboundFrame { frame, ack }) => {
                        match write_frame(sink.as_mut(), frame, write_timeout).await {
                            Ok(()) => {
                                last_outbound = Instant::now();
                                let _ = ack.send(Ok(()));
                            }
                            Err(reason) => {
                                let _ = ack.send(Err(ConnectionError::ConnectionLost(reason.clone())));
                                return DriveEnd::Lost(reason);
                            }
                        }
                    }
                    None => {
                        sink.close().await;
                        return DriveEnd::Shutdown;
                    }
                },

                _ = sleep_until(heartbeat_at) => {
                    let beat = Envelope::heartbeat(self.session_id.as_ref(), self.engine.local_actor());
                    let frame = match encode(&beat) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "failed to encode heartbeat");
                            last_outbound = Instant::now();
                            continue;
                        }
                    };
                    if let Err(reason) = write_frame(sink.as_mut(), frame, write_timeout).await {
                        return DriveEnd::Lost(reason);
                    }
                    trace!("heartbeat sent");
                    last_outbound = Instant::now();
                }

                _ = sleep_until(stale_at) => {
                    return DriveEnd::Lost(format!(
                        "no inbound frame for {:?}",
                        self.settings.liveness_timeout
                    ));
                }
            }
        }
    }

    /// Re-send requests whose continuations are still waiting, original ids intact.
    async fn replay(
        &self,
        sink: &mut dyn FrameSink,
        write_timeout: Duration,
    ) -> Result<(), String> {
        let pending = self.engine.replayable().await;
        if pending.is_empty() {
            return Ok(());
        }

        let mut count = 0usize;
        for env in pending {
            let frame = match encode(&env) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(message_id = %env.message_id, error = %e, "cannot re-encode request");
                    continue;
                }
            };
            write_frame(sink, frame, write_timeout).await?;
            debug!(thread_id = %env.thread_id, message_id = %env.message_id, "replayed request");
            count += 1;
        }

        info!(count, "replayed outstanding requests");
        self.emit(ConnectionEvent::Replayed { count });
        Ok(())
    }

    async fn accept(&self, frame: &[u8]) {
        let env = match decode(frame) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        if env.kind == MessageType::Heartbeat {
            trace!(actor = %env.actor, "heartbeat received");
            return;
        }

        if self.inbound.send(env).await.is_err() {
            debug!("inbound queue closed, dropping envelope");
        }
    }
}

/// `at + period`, saturating to roughly thirty years out.
fn after(at: Instant, period: Duration) -> Instant {
    at.checked_add(period)
        .unwrap_or_else(|| at + Duration::from_secs(86_400 * 365 * 30))
}

async fn write_frame(
    sink: &mut dyn FrameSink,
    frame: Vec<u8>,
    write_timeout: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {write_timeout:?}")),
    }
}
