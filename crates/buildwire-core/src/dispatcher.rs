// ABOUTME: Routes inbound envelopes to per-thread workers and invokes the registered handler.
// ABOUTME: One worker per threadId keeps receipt order; a semaphore bounds threads processed at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildwire_proto::{Actor, Envelope, MessageType, Status};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, trace, warn};

use crate::config::DispatcherConfig;
use crate::engine::{Ingested, ProtocolEngine};
use crate::error::ProtocolError;
use crate::outbox::Outbox;
use crate::thread::Observation;

/// Buffered envelopes per thread worker.
const WORKER_QUEUE: usize = 32;

/// Context provided to message handlers.
#[derive(Clone)]
pub struct HandlerContext {
    /// Outbound path for replies and follow-ups.
    pub outbox: Outbox,
    /// What ingesting the envelope did to its thread.
    pub observation: Observation,
}

impl HandlerContext {
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        self.outbox.engine()
    }

    pub fn local_actor(&self) -> Actor {
        self.outbox.engine().local_actor()
    }
}

/// A status change a handler asks the dispatcher to apply locally.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub status: Status,
    pub details: Option<String>,
}

/// Outcome of handling a message.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    /// Envelopes to send, in order.
    pub outbound: Vec<Envelope>,
    /// Status changes to apply to the envelope's thread, in order.
    pub transitions: Vec<TransitionRequest>,
}

impl HandleOutcome {
    /// Nothing further to do.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn send(mut self, env: Envelope) -> Self {
        self.outbound.push(env);
        self
    }

    pub fn transition(mut self, status: Status, details: Option<String>) -> Self {
        self.transitions.push(TransitionRequest { status, details });
        self
    }
}

/// Processes one message type.
///
/// Handlers run inside the thread's worker: anything slow (a build, a human
/// prompt) must be spawned so later messages on the thread are not held up.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        env: &Envelope,
    ) -> Result<HandleOutcome, ProtocolError>;
}

/// Message type to handler map.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with(mut self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageType) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<MessageType> {
        MessageType::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

struct Worker {
    id: u64,
    tx: mpsc::Sender<Envelope>,
}

pub struct Dispatcher {
    outbox: Outbox,
    registry: Arc<HandlerRegistry>,
    workers: Mutex<HashMap<String, Worker>>,
    permits: Arc<Semaphore>,
    idle: Duration,
    next_worker: AtomicU64,
}

impl Dispatcher {
    pub fn new(outbox: Outbox, registry: HandlerRegistry, config: &DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            registry: Arc::new(registry),
            workers: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            idle: config.worker_idle(),
            next_worker: AtomicU64::new(0),
        })
    }

    /// The bounded queue between the connection reader and [`Dispatcher::run`].
    pub fn queue(config: &DispatcherConfig) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(config.queue_capacity.max(1))
    }

    /// Route queued envelopes until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<Envelope>) {
        while let Some(env) = queue.recv().await {
            self.route(env).await;
        }
        debug!("inbound queue closed, dispatcher stopping");
    }

    /// Hand an envelope to its thread's worker, starting one if needed.
    pub async fn route(self: &Arc<Self>, env: Envelope) {
        if env.kind == MessageType::Heartbeat {
            trace!("heartbeat not dispatched");
            return;
        }

        // Held across the send so an idle worker cannot retire between lookup and send.
        let mut workers = self.workers.lock().await;
        let thread_id = env.thread_id.clone();
        let tx = workers
            .entry(thread_id.clone())
            .or_insert_with(|| self.spawn_worker(thread_id.clone()))
            .tx
            .clone();

        if let Err(mpsc::error::SendError(env)) = tx.send(env).await {
            warn!(thread_id = %thread_id, "worker gone, restarting");
            let worker = self.spawn_worker(thread_id.clone());
            if worker.tx.send(env).await.is_err() {
                warn!(thread_id = %thread_id, "restarted worker refused message");
            }
            workers.insert(thread_id, worker);
        }
    }

    /// Number of live thread workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    fn spawn_worker(self: &Arc<Self>, thread_id: String) -> Worker {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        debug!(thread_id = %thread_id, worker = id, "starting thread worker");
        tokio::spawn(Arc::clone(self).run_worker(thread_id, id, rx));
        Worker { id, tx }
    }

    async fn run_worker(self: Arc<Self>, thread_id: String, id: u64, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(env)) => self.process(env).await,
                Ok(None) => break,
                Err(_) => {
                    let mut workers = self.workers.lock().await;
                    match rx.try_recv() {
                        Ok(env) => {
                            drop(workers);
                            self.process(env).await;
                        }
                        Err(_) => {
                            if workers.get(&thread_id).is_some_and(|w| w.id == id) {
                                workers.remove(&thread_id);
                            }
                            debug!(thread_id = %thread_id, worker = id, "thread worker idle, exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, env: Envelope) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        let observation = match self.outbox.engine().ingest(&env).await {
            Ingested::Accepted(obs) | Ingested::Late(obs) => obs,
            Ingested::Duplicate | Ingested::Archived { .. } | Ingested::Ignored => return,
        };

        let Some(handler) = self.registry.get(env.kind) else {
            debug!(
                thread_id = %env.thread_id,
                message_id = %env.message_id,
                kind = %env.kind,
                "no handler registered"
            );
            return;
        };

        let ctx = HandlerContext {
            outbox: self.outbox.clone(),
            observation,
        };
        match handler.handle(&ctx, &env).await {
            Ok(outcome) => self.apply(&env, outcome).await,
            Err(e) => warn!(
                thread_id = %env.thread_id,
                message_id = %env.message_id,
                kind = %env.kind,
                error = %e,
                "handler failed"
            ),
        }
    }

    async fn apply(&self, env: &Envelope, outcome: HandleOutcome) {
        for request in outcome.transitions {
            if let Err(e) = self
                .outbox
                .engine()
                .apply_local_status(&env.thread_id, request.status, request.details)
                .await
            {
                warn!(thread_id = %env.thread_id, error = %e, "handler transition refused");
            }
        }

        for out in outcome.outbound {
            let message_id = out.message_id.clone();
            let result = if out.expects_reply() {
                self.outbox.request(out, None).await.map(|_| ())
            } else {
                self.outbox.send(out).await
            };
            if let Err(e) = result {
                warn!(
                    thread_id = %env.thread_id,
                    message_id = %message_id,
                    error = %e,
                    "handler output not delivered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryStore;
    use crate::config::BuildwireConfig;
    use crate::retry::{Retrier, Transmit};
    use tokio::sync::Notify;

    struct Sink;

    #[async_trait]
    impl Transmit for Sink {
        async fn transmit(&self, _frame: Vec<u8>) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    /// Records (thread, message) pairs in handling order.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            env: &Envelope,
        ) -> Result<HandleOutcome, ProtocolError> {
            self.seen
                .lock()
                .await
                .push((env.thread_id.clone(), env.message_id.clone()));
            Ok(HandleOutcome::ok())
        }
    }

    /// Blocks every message on one thread until released.
    struct Gate {
        blocked_thread: String,
        release: Arc<Notify>,
        inner: Arc<Recording>,
    }

    #[async_trait]
    impl MessageHandler for Gate {
        async fn handle(
            &self,
            ctx: &HandlerContext,
            env: &Envelope,
        ) -> Result<HandleOutcome, ProtocolError> {
            if env.thread_id == self.blocked_thread {
                self.release.notified().await;
            }
            self.inner.handle(ctx, env).await
        }
    }

    fn outbox() -> Outbox {
        let engine = ProtocolEngine::new(
            &BuildwireConfig::default(),
            Arc::new(MemoryStore::default()),
        );
        Outbox::new(engine, Retrier::default(), Arc::new(Sink))
    }

    async fn wait_for(recording: &Recording, count: usize) -> Vec<(String, String)> {
        for _ in 0..200 {
            let seen = recording.seen.lock().await.clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        recording.seen.lock().await.clone()
    }

    #[test]
    fn test_outcome_builder() {
        let env = Envelope::start(Actor::System, MessageType::StatusUpdate);
        let outcome = HandleOutcome::ok()
            .send(env.clone())
            .transition(Status::InProgress, None);
        assert_eq!(outcome.outbound, vec![env]);
        assert_eq!(outcome.transitions.len(), 1);
    }

    #[test]
    fn test_registry_kinds() {
        let registry = HandlerRegistry::new()
            .with(MessageType::StatusUpdate, Arc::new(Recording::default()))
            .with(MessageType::BuildFeature, Arc::new(Recording::default()));
        assert_eq!(
            registry.kinds(),
            vec![MessageType::BuildFeature, MessageType::StatusUpdate]
        );
        assert!(registry.get(MessageType::Heartbeat).is_none());
    }

    #[tokio::test]
    async fn test_per_thread_order_and_cross_thread_progress() {
        let recording = Arc::new(Recording::default());
        let release = Arc::new(Notify::new());

        let slow = Envelope::start(Actor::User, MessageType::QuestionToAi);
        let slow_next = slow.follow_up(Actor::User, MessageType::QuestionToAi);
        let fast = Envelope::start(Actor::User, MessageType::QuestionToAi);
        let fast_next = fast.follow_up(Actor::User, MessageType::QuestionToAi);

        let gate = Arc::new(Gate {
            blocked_thread: slow.thread_id.clone(),
            release: release.clone(),
            inner: recording.clone(),
        });
        let registry = HandlerRegistry::new().with(MessageType::QuestionToAi, gate);
        let dispatcher = Dispatcher::new(outbox(), registry, &DispatcherConfig::default());

        for env in [&slow, &slow_next, &fast, &fast_next] {
            dispatcher.route(env.clone()).await;
        }

        // the other thread proceeds while `slow` is blocked
        let seen = wait_for(&recording, 2).await;
        assert_eq!(
            seen,
            vec![
                (fast.thread_id.clone(), fast.message_id.clone()),
                (fast.thread_id.clone(), fast_next.message_id.clone()),
            ]
        );

        release.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.notify_one();
        let seen = wait_for(&recording, 4).await;
        assert_eq!(
            &seen[2..],
            &[
                (slow.thread_id.clone(), slow.message_id.clone()),
                (slow.thread_id.clone(), slow_next.message_id.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicates_dispatched_once() {
        let recording = Arc::new(Recording::default());
        let registry = HandlerRegistry::new().with(MessageType::StatusUpdate, recording.clone());
        let dispatcher = Dispatcher::new(outbox(), registry, &DispatcherConfig::default());

        let update = Envelope::start(Actor::Coder, MessageType::StatusUpdate);
        dispatcher.route(update.clone()).await;
        dispatcher.route(update.clone()).await;
        let follow = update.follow_up(Actor::Coder, MessageType::StatusUpdate);
        dispatcher.route(follow).await;

        let seen = wait_for(&recording, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.len(), 2);
        assert_eq!(recording.seen.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_exits_and_restarts() {
        let recording = Arc::new(Recording::default());
        let registry = HandlerRegistry::new().with(MessageType::StatusUpdate, recording.clone());
        let config = DispatcherConfig {
            worker_idle_secs: 5,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(outbox(), registry, &config);

        let first = Envelope::start(Actor::Coder, MessageType::StatusUpdate);
        dispatcher.route(first.clone()).await;
        assert_eq!(dispatcher.worker_count().await, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(dispatcher.worker_count().await, 0);

        dispatcher
            .route(first.follow_up(Actor::Coder, MessageType::StatusUpdate))
            .await;
        let seen = wait_for(&recording, 2).await;
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_late_reply_reaches_handler_without_reopening() {
        let recording = Arc::new(Recording::default());
        let registry = HandlerRegistry::new().with(MessageType::StatusUpdate, recording.clone());
        let outbox = outbox();
        let engine = outbox.engine().clone();
        let dispatcher = Dispatcher::new(outbox, registry, &DispatcherConfig::default());

        let request = Envelope::start(Actor::User, MessageType::BuildFeature)
            .with_status(Status::Initiated);
        engine.ingest(&request).await;
        engine.fail_thread(&request.thread_id, "no reply").await.unwrap();
        assert_eq!(engine.thread_counts().await, (0, 1));

        let late = request
            .reply_to(Actor::Coder, MessageType::StatusUpdate)
            .with_status(Status::InProgress);
        dispatcher.route(late.clone()).await;

        let seen = wait_for(&recording, 1).await;
        assert_eq!(seen, vec![(late.thread_id.clone(), late.message_id.clone())]);
        assert_eq!(engine.status(&request.thread_id).await, Some(Status::Error));
        assert_eq!(engine.thread_counts().await, (0, 1));
    }

    #[tokio::test]
    async fn test_handler_outcome_applied() {
        struct Escalate;

        #[async_trait]
        impl MessageHandler for Escalate {
            async fn handle(
                &self,
                _ctx: &HandlerContext,
                _env: &Envelope,
            ) -> Result<HandleOutcome, ProtocolError> {
                Ok(HandleOutcome::ok().transition(Status::InProgress, Some("picked up".into())))
            }
        }

        let outbox = outbox();
        let engine = outbox.engine().clone();
        let registry = HandlerRegistry::new().with(MessageType::QuestionToAi, Arc::new(Escalate));
        let dispatcher = Dispatcher::new(outbox, registry, &DispatcherConfig::default());

        let question = Envelope::start(Actor::User, MessageType::QuestionToAi);
        dispatcher.route(question.clone()).await;

        for _ in 0..200 {
            if engine.status(&question.thread_id).await == Some(Status::InProgress) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transition was not applied");
    }
}
