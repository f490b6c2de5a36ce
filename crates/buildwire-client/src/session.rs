// ABOUTME: Session assembly: engine, dispatcher, sweeper and connection manager wired together.
// ABOUTME: Owns every background task of one client and tears them down together.

use std::sync::Arc;
use std::time::Duration;

use buildwire_core::{
    default_registry, BuildwireConfig, Collaborators, ContinuationOutcome, Dispatcher,
    HandlerRegistry, Outbox, PendingReply, PersistenceStore, ProtocolEngine, ProtocolError,
    Retrier, ThreadEvent,
};
use buildwire_proto::Envelope;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionSettings};
use crate::error::ConnectionError;
use crate::transport::Connector;

/// A running protocol client.
///
/// Must be started inside a tokio runtime.
pub struct Session {
    engine: Arc<ProtocolEngine>,
    outbox: Outbox,
    connection: ConnectionHandle,
    shutdown: CancellationToken,
    manager: JoinHandle<Result<(), ConnectionError>>,
    background: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start with the default handlers over the given collaborators.
    pub fn start(
        config: &BuildwireConfig,
        connector: Arc<dyn Connector>,
        collaborators: Collaborators,
    ) -> Self {
        let registry = default_registry(&collaborators);
        Self::start_with(config, connector, registry, collaborators.store)
    }

    pub fn start_with(
        config: &BuildwireConfig,
        connector: Arc<dyn Connector>,
        registry: HandlerRegistry,
        store: Arc<dyn PersistenceStore>,
    ) -> Self {
        let engine = ProtocolEngine::new(config, store);
        let shutdown = CancellationToken::new();

        let (inbound_tx, inbound_rx) = Dispatcher::queue(&config.dispatcher);
        let (manager, connection) = ConnectionManager::new(
            ConnectionSettings::from_config(config),
            connector,
            engine.clone(),
            inbound_tx,
            shutdown.clone(),
        );

        let outbox = Outbox::new(
            engine.clone(),
            Retrier::new(config.retry.policy()),
            Arc::new(connection.clone()),
        );
        let dispatcher = Dispatcher::new(outbox.clone(), registry, &config.dispatcher);

        let background = vec![
            tokio::spawn(dispatcher.run(inbound_rx)),
            tokio::spawn(
                engine
                    .clone()
                    .run_sweeper(config.continuation.sweep_interval(), shutdown.clone()),
            ),
        ];
        let manager = tokio::spawn(manager.run());

        debug!(session_id = %connection.session_id(), "session started");
        Self {
            engine,
            outbox,
            connection,
            shutdown,
            manager,
            background,
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn session_id(&self) -> &str {
        self.connection.session_id()
    }

    pub fn thread_events(&self) -> broadcast::Receiver<ThreadEvent> {
        self.engine.subscribe()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn send(&self, env: Envelope) -> Result<(), ProtocolError> {
        self.outbox.send(env).await
    }

    pub async fn request(
        &self,
        env: Envelope,
        deadline: Option<Duration>,
    ) -> Result<PendingReply, ProtocolError> {
        self.outbox.request(env, deadline).await
    }

    pub async fn ask(
        &self,
        env: Envelope,
        deadline: Option<Duration>,
    ) -> Result<ContinuationOutcome, ProtocolError> {
        self.outbox.ask(env, deadline).await
    }

    /// Wait for the connection manager to finish, then stop everything else.
    ///
    /// Returns `ReconnectAbandoned` if the server could not be reached again.
    pub async fn wait(self) -> Result<(), ConnectionError> {
        let result = match self.manager.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "connection task failed");
                Err(ConnectionError::ConnectionLost(format!(
                    "connection task failed: {e}"
                )))
            }
        };

        self.shutdown.cancel();
        self.engine.cancel_all("session ended").await;
        for task in self.background {
            task.abort();
        }
        result
    }

    /// Request shutdown and wait for it.
    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        self.shutdown.cancel();
        self.wait().await
    }
}
