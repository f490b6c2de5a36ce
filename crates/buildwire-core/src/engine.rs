// ABOUTME: ProtocolEngine ties the thread table, state machine and correlation together.
// ABOUTME: Every envelope in or out passes through here; terminal threads are persisted and archived.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildwire_proto::{Actor, Envelope, MessageType, Origin, Status, StatusDetails};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::PersistenceStore;
use crate::config::BuildwireConfig;
use crate::correlation::{Continuation, ContinuationOutcome, Correlation, PendingReply};
use crate::error::ProtocolError;
use crate::events::ThreadEvent;
use crate::state::Transition;
use crate::table::{LateEntry, Opened, ThreadTable};
use crate::thread::{ClarificationChange, Direction, Observation, Thread, ThreadSnapshot};

const EVENT_CAPACITY: usize = 256;

/// What happened to an envelope offered to the engine.
#[derive(Debug, Clone)]
pub enum Ingested {
    /// Logged and applied to its thread.
    Accepted(Observation),
    /// The thread already holds this messageId.
    Duplicate,
    /// Inbound message for an archived thread. It was added to the retained
    /// log and goes on to its handler, but the thread's state is untouched.
    Late(Observation),
    /// The thread was archived and the message may not reopen it.
    Archived { status: Status },
    /// Heartbeats never enter a thread.
    Ignored,
}

pub struct ProtocolEngine {
    local_actor: Actor,
    table: ThreadTable,
    store: Arc<dyn PersistenceStore>,
    events: broadcast::Sender<ThreadEvent>,
    default_deadline: Duration,
    idle_archive: Duration,
    seq: AtomicU64,
}

impl fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("local_actor", &self.local_actor)
            .field("default_deadline", &self.default_deadline)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    pub fn new(config: &BuildwireConfig, store: Arc<dyn PersistenceStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            local_actor: config.identity.actor,
            table: ThreadTable::new(config.threads.archive_retention),
            store,
            events,
            default_deadline: config.continuation.default_deadline(),
            idle_archive: config.threads.idle_archive(),
            seq: AtomicU64::new(0),
        })
    }

    /// The actor this process speaks as.
    pub fn local_actor(&self) -> Actor {
        self.local_actor
    }

    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThreadEvent> {
        self.events.subscribe()
    }

    /// Apply an inbound envelope to its thread.
    pub async fn ingest(&self, env: &Envelope) -> Ingested {
        self.observe(env, Direction::Inbound, None).await.0
    }

    /// Log an outbound envelope that expects no reply, applying its status.
    /// The thread is not archived until [`ProtocolEngine::delivered`] is called.
    pub async fn record_outbound(&self, env: &Envelope) -> Result<Observation, ProtocolError> {
        match self.observe(env, Direction::Outbound, None).await.0 {
            Ingested::Accepted(obs) => Ok(obs),
            other => Err(rejection(env, other)),
        }
    }

    /// Log an outbound request and register its continuation before it is sent.
    pub async fn register_request(
        self: &Arc<Self>,
        env: &Envelope,
        deadline: Option<Duration>,
    ) -> Result<(Observation, PendingReply), ProtocolError> {
        let deadline = Instant::now() + deadline.unwrap_or(self.default_deadline);
        match self.observe(env, Direction::Outbound, Some(deadline)).await {
            (Ingested::Accepted(obs), Some(rx)) => {
                let pending = PendingReply::new(
                    env.thread_id.clone(),
                    env.message_id.clone(),
                    deadline,
                    rx,
                    Arc::clone(self),
                );
                Ok((obs, pending))
            }
            (other, _) => Err(rejection(env, other)),
        }
    }

    async fn observe(
        &self,
        env: &Envelope,
        direction: Direction,
        register: Option<Instant>,
    ) -> (Ingested, Option<oneshot::Receiver<ContinuationOutcome>>) {
        if env.kind == MessageType::Heartbeat {
            return (Ingested::Ignored, None);
        }

        let (handle, created) = match self.table.open(env).await {
            Opened::Active { handle, created } => (handle, created),
            Opened::Archived(snapshot) => {
                return (self.late(env, direction, snapshot.status).await, None);
            }
        };

        let mut thread = handle.lock().await;
        if thread.is_archived() {
            let status = thread.status();
            drop(thread);
            return (self.late(env, direction, status).await, None);
        }

        let Some(mut obs) = thread.observe(env, direction) else {
            debug!(
                thread_id = %env.thread_id,
                message_id = %env.message_id,
                ?direction,
                "duplicate message ignored"
            );
            return (Ingested::Duplicate, None);
        };
        obs.thread_created = created;

        let rx = register.map(|deadline| {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let (continuation, rx) = Continuation::new(env.clone(), deadline, seq);
            thread.register(continuation);
            rx
        });

        let mut settled = Settle::capture(&thread, &obs);
        drop(thread);

        // A failed delivery may still need to move the thread to Error.
        if direction == Direction::Outbound {
            settled.archivable = false;
        }
        self.finish(&obs, env.details(), env.status, settled).await;
        (Ingested::Accepted(obs), rx)
    }

    /// Handle a message for an archived thread. Inbound responses and
    /// notifications are kept for audit and handed on; nothing is sent into,
    /// and no new request reopens, a finished thread.
    async fn late(&self, env: &Envelope, direction: Direction, status: Status) -> Ingested {
        if direction != Direction::Inbound {
            self.report_archived(env, status);
            return Ingested::Archived { status };
        }

        match self.table.log_late(env).await {
            LateEntry::Duplicate => {
                debug!(
                    thread_id = %env.thread_id,
                    message_id = %env.message_id,
                    "duplicate message for archived thread ignored"
                );
                return Ingested::Duplicate;
            }
            LateEntry::Logged | LateEntry::Evicted => {}
        }
        self.report_archived(env, status);

        let obs = Observation::late(env, status);
        if obs.correlation == Correlation::Fresh {
            return Ingested::Archived { status };
        }
        Ingested::Late(obs)
    }

    /// Apply a status decided by this process. The change is logged as a
    /// local `status_update` on the thread and never transmitted.
    pub async fn apply_local_status(
        &self,
        thread_id: &str,
        status: Status,
        details: Option<String>,
    ) -> Result<Status, ProtocolError> {
        let Some(handle) = self.table.get(thread_id).await else {
            return Err(self.missing(thread_id).await);
        };

        let mut thread = handle.lock().await;
        if thread.is_archived() {
            return Err(ProtocolError::ThreadArchived(thread_id.to_string()));
        }

        let env = local_status(&thread, self.local_actor, status, details);
        let Some(obs) = thread.observe(&env, Direction::Local) else {
            return Err(ProtocolError::DuplicateMessage {
                thread_id: thread_id.to_string(),
                message_id: env.message_id,
            });
        };

        let settled = Settle::capture(&thread, &obs);
        drop(thread);

        self.finish(&obs, env.details(), env.status, settled).await;
        match obs.transition {
            Some(Transition::Stale(stale)) => Err(stale.into()),
            _ => Ok(obs.status),
        }
    }

    /// An outbound envelope on this thread reached the transport; archive the
    /// thread if that left it with nothing to wait for.
    pub async fn delivered(&self, thread_id: &str) {
        self.try_archive(thread_id).await;
    }

    /// Move a thread to `Error`, e.g. after a delivery failure or timeout.
    pub async fn fail_thread(
        &self,
        thread_id: &str,
        details: impl Into<String>,
    ) -> Result<Status, ProtocolError> {
        self.apply_local_status(thread_id, Status::Error, Some(details.into()))
            .await
    }

    /// Remove a continuation and resolve it as `Timeout`. Returns false if
    /// it was already resolved.
    pub async fn expire_continuation(&self, thread_id: &str, message_id: &str) -> bool {
        let Some(handle) = self.table.get(thread_id).await else {
            return false;
        };
        let taken = handle.lock().await.take_continuation(message_id);
        match taken {
            Some(continuation) => {
                self.expired(thread_id, vec![continuation]).await;
                true
            }
            None => false,
        }
    }

    /// Resolve every continuation whose deadline has passed. Returns how many expired.
    pub async fn expire_due(&self) -> usize {
        let now = Instant::now();
        let mut count = 0;
        for handle in self.table.active_handles().await {
            let (thread_id, expired) = {
                let mut thread = handle.lock().await;
                (thread.id().to_string(), thread.take_expired(now))
            };
            if expired.is_empty() {
                continue;
            }
            count += expired.len();
            self.expired(&thread_id, expired).await;
        }
        count
    }

    async fn expired(&self, thread_id: &str, continuations: Vec<Continuation>) {
        for continuation in continuations {
            let request = continuation.request.clone();
            warn!(
                thread_id = %thread_id,
                message_id = %request.message_id,
                kind = %request.kind,
                "no reply before deadline"
            );
            continuation.resolve(ContinuationOutcome::Timeout {
                message_id: request.message_id.clone(),
            });

            if request.kind == MessageType::BuildFeature {
                let details = format!(
                    "no reply to build request {} before deadline",
                    request.message_id
                );
                if let Err(e) = self.fail_thread(thread_id, details).await {
                    debug!(thread_id = %thread_id, error = %e, "timed-out build left as is");
                }
            }
        }
        self.try_archive(thread_id).await;
    }

    /// Drop a continuation whose request could not be delivered.
    pub async fn cancel_continuation(&self, thread_id: &str, message_id: &str, reason: &str) {
        let Some(handle) = self.table.get(thread_id).await else {
            return;
        };
        let taken = handle.lock().await.take_continuation(message_id);
        if let Some(continuation) = taken {
            continuation.resolve(ContinuationOutcome::Cancelled {
                reason: reason.to_string(),
            });
            self.try_archive(thread_id).await;
        }
    }

    /// Requests still awaiting a reply before their deadline, in registration order.
    pub async fn replayable(&self) -> Vec<Envelope> {
        let now = Instant::now();
        let mut live = Vec::new();
        for handle in self.table.active_handles().await {
            live.extend(handle.lock().await.live_requests(now));
        }
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, env)| env).collect()
    }

    /// Cancel every outstanding continuation; waiters see `Cancelled`.
    pub async fn cancel_all(&self, reason: &str) {
        for handle in self.table.active_handles().await {
            let thread_id = {
                let mut thread = handle.lock().await;
                thread.cancel_all(reason);
                thread.id().to_string()
            };
            self.try_archive(&thread_id).await;
        }
    }

    /// Archive conversations that have been quiet for the idle period with
    /// nothing outstanding. Returns how many were archived.
    pub async fn archive_idle(&self) -> usize {
        let now = Instant::now();
        let mut count = 0;
        for thread_id in self.table.active_ids().await {
            let idle = self
                .table
                .archive_when(&thread_id, |thread| thread.is_idle(now, self.idle_archive))
                .await;
            if let Some(snapshot) = idle {
                debug!(thread_id = %thread_id, "idle conversation archived");
                self.archived(&snapshot);
                count += 1;
            }
        }
        count
    }

    /// Sweep expired continuations and idle conversations until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.expire_due().await;
                    let idle = self.archive_idle().await;
                    if expired > 0 || idle > 0 {
                        debug!(expired, idle, "sweep finished");
                    }
                }
            }
        }
    }

    pub async fn snapshot(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        match self.table.get(thread_id).await {
            Some(handle) => Some(handle.lock().await.snapshot()),
            None => self.table.archived(thread_id).await,
        }
    }

    pub async fn status(&self, thread_id: &str) -> Option<Status> {
        match self.table.get(thread_id).await {
            Some(handle) => Some(handle.lock().await.status()),
            None => self.table.archived(thread_id).await.map(|s| s.status),
        }
    }

    pub async fn active_threads(&self) -> Vec<String> {
        self.table.active_ids().await
    }

    /// (active, archived) thread counts.
    pub async fn thread_counts(&self) -> (usize, usize) {
        self.table.counts().await
    }

    async fn missing(&self, thread_id: &str) -> ProtocolError {
        if self.table.archived(thread_id).await.is_some() {
            ProtocolError::ThreadArchived(thread_id.to_string())
        } else {
            ProtocolError::ThreadNotFound(thread_id.to_string())
        }
    }

    async fn finish(
        &self,
        obs: &Observation,
        details: Option<&str>,
        attempted: Option<Status>,
        settled: Settle,
    ) {
        self.publish(obs, details, attempted);

        if let Some(snapshot) = settled.terminal {
            info!(
                thread_id = %snapshot.thread_id,
                status = %snapshot.status,
                messages = snapshot.log.len(),
                "thread finished"
            );
            if let Err(e) = self.store.record_thread(&snapshot).await {
                error!(thread_id = %snapshot.thread_id, error = %e, "failed to persist thread");
            }
        }

        if settled.archivable {
            self.try_archive(&obs.thread_id).await;
        }
    }

    fn publish(&self, obs: &Observation, details: Option<&str>, attempted: Option<Status>) {
        let thread_id = obs.thread_id.clone();

        if obs.thread_created {
            debug!(thread_id = %thread_id, "thread opened");
            self.emit(ThreadEvent::Created {
                thread_id: thread_id.clone(),
            });
        }

        match &obs.transition {
            Some(Transition::Applied { from, to }) => {
                info!(thread_id = %thread_id, %from, %to, "thread status changed");
                self.emit(ThreadEvent::Transitioned {
                    thread_id: thread_id.clone(),
                    from: *from,
                    to: *to,
                    details: details.map(str::to_string),
                });
            }
            Some(Transition::Stale(stale)) => {
                warn!(
                    thread_id = %thread_id,
                    message_id = %obs.message_id,
                    current = %stale.current,
                    attempted = %stale.attempted,
                    "stale status ignored"
                );
                self.emit(ThreadEvent::Stale {
                    thread_id: thread_id.clone(),
                    message_id: obs.message_id.clone(),
                    current: stale.current,
                    attempted,
                });
            }
            Some(Transition::Unchanged(_)) | None => {}
        }

        match &obs.clarification {
            Some(ClarificationChange::Requested { message_id }) => {
                info!(thread_id = %thread_id, message_id = %message_id, "awaiting clarification");
                self.emit(ThreadEvent::ClarificationRequested {
                    thread_id: thread_id.clone(),
                    message_id: message_id.clone(),
                });
            }
            Some(ClarificationChange::Answered { message_id }) => {
                info!(thread_id = %thread_id, message_id = %message_id, "clarification answered");
                self.emit(ThreadEvent::ClarificationAnswered {
                    thread_id,
                    message_id: message_id.clone(),
                });
            }
            None => {}
        }
    }

    fn report_archived(&self, env: &Envelope, status: Status) {
        warn!(
            thread_id = %env.thread_id,
            message_id = %env.message_id,
            kind = %env.kind,
            %status,
            "message for archived thread"
        );
        self.emit(ThreadEvent::Stale {
            thread_id: env.thread_id.clone(),
            message_id: env.message_id.clone(),
            current: status,
            attempted: env.status,
        });
    }

    async fn try_archive(&self, thread_id: &str) {
        if let Some(snapshot) = self.table.archive(thread_id).await {
            self.archived(&snapshot);
        }
    }

    fn archived(&self, snapshot: &ThreadSnapshot) {
        info!(thread_id = %snapshot.thread_id, status = %snapshot.status, "thread archived");
        self.emit(ThreadEvent::Archived {
            thread_id: snapshot.thread_id.clone(),
            status: snapshot.status,
        });
    }

    fn emit(&self, event: ThreadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Post-lock work captured while the thread lock was held.
struct Settle {
    terminal: Option<ThreadSnapshot>,
    archivable: bool,
}

impl Settle {
    fn capture(thread: &Thread, obs: &Observation) -> Self {
        let entered_terminal = obs
            .transition
            .as_ref()
            .and_then(Transition::entered_terminal)
            .is_some();
        Self {
            terminal: entered_terminal.then(|| thread.snapshot()),
            archivable: thread.is_archivable(),
        }
    }
}

fn local_status(
    thread: &Thread,
    actor: Actor,
    status: Status,
    details: Option<String>,
) -> Envelope {
    let (origin_message_id, origin_actor) = thread.origin();
    let mut env = Envelope::start_in(thread.id(), actor, MessageType::StatusUpdate).with_status(status);
    env.origin = Origin {
        origin_message_id: origin_message_id.to_string(),
        origin_actor,
        responding_to_message_id: None,
        responding_to_actor: None,
    };
    if let Some(details) = details {
        env = env.with_status_details(StatusDetails::with_details(details));
    }
    env
}

fn rejection(env: &Envelope, ingested: Ingested) -> ProtocolError {
    match ingested {
        Ingested::Duplicate => ProtocolError::DuplicateMessage {
            thread_id: env.thread_id.clone(),
            message_id: env.message_id.clone(),
        },
        Ingested::Archived { .. } | Ingested::Late(_) => {
            ProtocolError::ThreadArchived(env.thread_id.clone())
        }
        Ingested::Ignored => ProtocolError::HeartbeatNotThreaded,
        Ingested::Accepted(_) => ProtocolError::Handler(format!(
            "request {} accepted without a continuation",
            env.message_id
        )),
    }
}
