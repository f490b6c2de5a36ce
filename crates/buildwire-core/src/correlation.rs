// ABOUTME: Request/response correlation: continuations keyed by the request's messageId.
// ABOUTME: PendingReply races the reply against the deadline; expiry removes the continuation.

use std::collections::HashMap;
use std::sync::Arc;

use buildwire_proto::Envelope;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::engine::ProtocolEngine;

/// How a continuation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationOutcome {
    /// The correlated response.
    Reply(Envelope),
    /// No response before the deadline.
    Timeout { message_id: String },
    /// Abandoned before a reply could arrive (delivery failed, engine shut down).
    Cancelled { reason: String },
}

impl ContinuationOutcome {
    pub fn reply(self) -> Option<Envelope> {
        match self {
            ContinuationOutcome::Reply(env) => Some(env),
            _ => None,
        }
    }
}

/// Where an envelope fits among the thread's outstanding requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Answered a live request; its continuation has been resolved.
    Response { request_id: String },
    /// Answers something with no live continuation (unknown, or already timed out).
    Unmatched { responding_to: String },
    /// A new request that waits for an answer.
    Fresh,
    /// A new message that waits for nothing.
    Notification,
}

/// A registered wait for a reply.
#[derive(Debug)]
pub(crate) struct Continuation {
    pub request: Envelope,
    pub deadline: Instant,
    /// Registration order, used for replay.
    pub seq: u64,
    resolver: oneshot::Sender<ContinuationOutcome>,
}

impl Continuation {
    pub fn new(
        request: Envelope,
        deadline: Instant,
        seq: u64,
    ) -> (Self, oneshot::Receiver<ContinuationOutcome>) {
        let (resolver, rx) = oneshot::channel();
        (
            Self {
                request,
                deadline,
                seq,
                resolver,
            },
            rx,
        )
    }

    pub fn resolve(self, outcome: ContinuationOutcome) {
        // The waiter may have gone away; nothing to deliver to then.
        let _ = self.resolver.send(outcome);
    }
}

/// Correlate an inbound envelope, resolving its continuation if one is live.
pub(crate) fn correlate(
    outstanding: &mut HashMap<String, Continuation>,
    env: &Envelope,
) -> Correlation {
    let Some(responding_to) = env.responding_to() else {
        return classify(env);
    };

    match outstanding.remove(responding_to) {
        Some(continuation) => {
            debug!(
                thread_id = %env.thread_id,
                message_id = %env.message_id,
                request_id = %responding_to,
                "reply correlated"
            );
            continuation.resolve(ContinuationOutcome::Reply(env.clone()));
            Correlation::Response {
                request_id: responding_to.to_string(),
            }
        }
        None => {
            debug!(
                thread_id = %env.thread_id,
                message_id = %env.message_id,
                responding_to = %responding_to,
                "reply has no live continuation"
            );
            Correlation::Unmatched {
                responding_to: responding_to.to_string(),
            }
        }
    }
}

/// Classify an envelope without touching continuations.
pub(crate) fn classify(env: &Envelope) -> Correlation {
    match env.responding_to() {
        Some(id) => Correlation::Unmatched {
            responding_to: id.to_string(),
        },
        None if env.kind.expects_reply() => Correlation::Fresh,
        None => Correlation::Notification,
    }
}

/// Handle on a registered request. Await [`PendingReply::wait`] for the outcome.
#[derive(Debug)]
pub struct PendingReply {
    thread_id: String,
    message_id: String,
    deadline: Instant,
    rx: oneshot::Receiver<ContinuationOutcome>,
    engine: Arc<ProtocolEngine>,
}

impl PendingReply {
    pub(crate) fn new(
        thread_id: String,
        message_id: String,
        deadline: Instant,
        rx: oneshot::Receiver<ContinuationOutcome>,
        engine: Arc<ProtocolEngine>,
    ) -> Self {
        Self {
            thread_id,
            message_id,
            deadline,
            rx,
            engine,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, or `Timeout` once the deadline passes.
    pub async fn wait(mut self) -> ContinuationOutcome {
        match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ContinuationOutcome::Cancelled {
                reason: "continuation dropped".to_string(),
            },
            Err(_) => {
                // Expire it ourselves unless the sweeper or a racing reply got there first;
                // either way the resolver delivers the final outcome to this receiver.
                self.engine
                    .expire_continuation(&self.thread_id, &self.message_id)
                    .await;
                match self.rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            thread_id = %self.thread_id,
                            message_id = %self.message_id,
                            "continuation vanished at deadline"
                        );
                        ContinuationOutcome::Timeout {
                            message_id: self.message_id,
                        }
                    }
                }
            }
        }
    }
}
