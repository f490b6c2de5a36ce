// ABOUTME: Per-thread record: lifecycle status, message log, clarification flag, continuations.
// ABOUTME: Thread::observe applies one envelope atomically under the thread's lock.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use buildwire_proto::{Actor, Envelope, MessageType, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::correlation::{self, Continuation, ContinuationOutcome, Correlation};
use crate::state::{self, Transition};

/// Which way an envelope travelled relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    /// Recorded by this process without being transmitted.
    Local,
}

/// Clarification flag change caused by one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationChange {
    Requested { message_id: String },
    Answered { message_id: String },
}

/// What observing one envelope did to its thread.
#[derive(Debug, Clone)]
pub struct Observation {
    pub thread_id: String,
    pub message_id: String,
    pub thread_created: bool,
    pub correlation: Correlation,
    pub transition: Option<Transition>,
    pub clarification: Option<ClarificationChange>,
    /// Status after the envelope was applied.
    pub status: Status,
    pub awaiting_clarification: bool,
}

impl Observation {
    pub fn is_fresh(&self) -> bool {
        matches!(self.correlation, Correlation::Fresh | Correlation::Notification)
    }

    /// An inbound envelope for a thread already archived in `status`.
    /// Continuations are gone, so a response correlates as unmatched.
    pub(crate) fn late(env: &Envelope, status: Status) -> Self {
        Self {
            thread_id: env.thread_id.clone(),
            message_id: env.message_id.clone(),
            thread_created: false,
            correlation: correlation::classify(env),
            transition: None,
            clarification: None,
            status,
            awaiting_clarification: false,
        }
    }
}

/// Immutable copy of a thread, used for persistence and archival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub status: Status,
    pub origin_message_id: String,
    pub origin_actor: Actor,
    pub awaiting_clarification: bool,
    pub outstanding: Vec<String>,
    pub log: Vec<LoggedEnvelope>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEnvelope {
    pub direction: Direction,
    pub envelope: Envelope,
}

/// One build or question conversation.
#[derive(Debug)]
pub struct Thread {
    id: String,
    origin_message_id: String,
    origin_actor: Actor,
    status: Status,
    awaiting: HashSet<String>,
    log: Vec<LoggedEnvelope>,
    seen: HashSet<String>,
    outstanding: HashMap<String, Continuation>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    touched: Instant,
    /// Seen a build request or a lifecycle status.
    lifecycle: bool,
    /// Seen a `question_to_ai` answer.
    answered: bool,
    archived: bool,
}

impl Thread {
    /// Open a thread from the first envelope seen for its id.
    pub fn new(first: &Envelope) -> Self {
        let now = Utc::now();
        Self {
            id: first.thread_id.clone(),
            origin_message_id: first.origin.origin_message_id.clone(),
            origin_actor: first.origin.origin_actor,
            status: Status::Initiated,
            awaiting: HashSet::new(),
            log: Vec::new(),
            seen: HashSet::new(),
            outstanding: HashMap::new(),
            created_at: now,
            last_activity: now,
            touched: Instant::now(),
            lifecycle: false,
            answered: false,
            archived: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn awaiting_clarification(&self) -> bool {
        !self.awaiting.is_empty()
    }

    pub fn log(&self) -> &[LoggedEnvelope] {
        &self.log
    }

    pub fn origin(&self) -> (&str, Actor) {
        (&self.origin_message_id, self.origin_actor)
    }

    pub fn outstanding_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.outstanding.iter().collect();
        ids.sort_by_key(|(_, c)| c.seq);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn has_seen(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    /// Nothing left to wait for: a build that reached a terminal status, or a
    /// conversation whose question was answered.
    pub fn is_archivable(&self) -> bool {
        if !self.outstanding.is_empty() {
            return false;
        }
        if self.lifecycle {
            self.status.is_terminal()
        } else {
            self.answered
        }
    }

    /// A conversation with nothing outstanding that has been quiet for `idle`.
    /// Builds only leave through a terminal status.
    pub fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        !self.lifecycle
            && self.outstanding.is_empty()
            && now.saturating_duration_since(self.touched) >= idle
    }

    pub(crate) fn mark_archived(&mut self) {
        self.archived = true;
    }

    /// Apply one envelope: log it, correlate it, update the clarification
    /// flag, then the lifecycle status. Returns `None` for a duplicate id.
    pub fn observe(&mut self, env: &Envelope, direction: Direction) -> Option<Observation> {
        if !self.seen.insert(env.message_id.clone()) {
            return None;
        }

        if env.origin.origin_message_id != self.origin_message_id
            || env.origin.origin_actor != self.origin_actor
        {
            warn!(
                thread_id = %self.id,
                message_id = %env.message_id,
                expected = %self.origin_message_id,
                got = %env.origin.origin_message_id,
                "origin does not match thread"
            );
        }

        self.log.push(LoggedEnvelope {
            direction,
            envelope: env.clone(),
        });
        self.last_activity = Utc::now();
        self.touched = Instant::now();

        if env.kind == MessageType::BuildFeature
            || (env.kind.drives_lifecycle() && env.status.is_some())
        {
            self.lifecycle = true;
        }
        if env.kind == MessageType::QuestionToAi && env.is_response() {
            self.answered = true;
        }

        let correlation = match direction {
            Direction::Inbound => correlation::correlate(&mut self.outstanding, env),
            Direction::Outbound | Direction::Local => correlation::classify(env),
        };

        let clarification = self.update_clarification(env);

        let transition = match (env.kind.drives_lifecycle(), env.status) {
            (true, Some(status)) => Some(self.offer(status)),
            _ => None,
        };

        Some(Observation {
            thread_id: self.id.clone(),
            message_id: env.message_id.clone(),
            thread_created: false,
            correlation,
            transition,
            clarification,
            status: self.status,
            awaiting_clarification: self.awaiting_clarification(),
        })
    }

    fn update_clarification(&mut self, env: &Envelope) -> Option<ClarificationChange> {
        // Any User reply naming an open clarification answers it, whatever its type.
        if let Some(answered) = env.responding_to() {
            if env.actor == Actor::User && self.awaiting.remove(answered) {
                return Some(ClarificationChange::Answered {
                    message_id: answered.to_string(),
                });
            }
        }

        if env.kind != MessageType::ClarificationNeededFromUser || env.is_response() {
            return None;
        }

        if self.status == Status::InProgress {
            self.awaiting.insert(env.message_id.clone());
            Some(ClarificationChange::Requested {
                message_id: env.message_id.clone(),
            })
        } else {
            debug!(
                thread_id = %self.id,
                status = %self.status,
                "clarification outside InProgress leaves flag untouched"
            );
            None
        }
    }

    fn offer(&mut self, status: Status) -> Transition {
        let transition = state::next(&self.id, self.status, status);
        if let Transition::Applied { to, .. } = transition {
            self.status = to;
            if to.is_terminal() {
                self.awaiting.clear();
            }
        }
        transition
    }

    pub(crate) fn register(&mut self, continuation: Continuation) {
        self.outstanding
            .insert(continuation.request.message_id.clone(), continuation);
    }

    pub(crate) fn take_continuation(&mut self, message_id: &str) -> Option<Continuation> {
        self.outstanding.remove(message_id)
    }

    /// Remove every continuation whose deadline is at or before `now`.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Continuation> {
        let due: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired: Vec<Continuation> = due
            .iter()
            .filter_map(|id| self.outstanding.remove(id))
            .collect();
        expired.sort_by_key(|c| c.seq);
        expired
    }

    /// Requests still awaiting a reply whose deadline is after `now`, with their registration order.
    pub(crate) fn live_requests(&self, now: Instant) -> Vec<(u64, Envelope)> {
        self.outstanding
            .values()
            .filter(|c| c.deadline > now)
            .map(|c| (c.seq, c.request.clone()))
            .collect()
    }

    /// Resolve every outstanding continuation, e.g. when the engine shuts down.
    pub(crate) fn cancel_all(&mut self, reason: &str) {
        for (_, continuation) in self.outstanding.drain() {
            continuation.resolve(ContinuationOutcome::Cancelled {
                reason: reason.to_string(),
            });
        }
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            thread_id: self.id.clone(),
            status: self.status,
            origin_message_id: self.origin_message_id.clone(),
            origin_actor: self.origin_actor,
            awaiting_clarification: self.awaiting_clarification(),
            outstanding: self.outstanding_ids(),
            log: self.log.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}
