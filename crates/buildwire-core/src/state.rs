// ABOUTME: Lifecycle state machine for build/question threads.
// ABOUTME: Initiated -> InProgress -> {Completed, Failed, Error}; the first terminal status wins.

use buildwire_proto::Status;
use thiserror::Error;

/// A status change the state machine refused to apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stale transition on thread '{thread_id}': {current} -> {attempted}")]
pub struct StaleTransition {
    pub thread_id: String,
    pub current: Status,
    pub attempted: Status,
}

/// Result of offering a status to a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// State moved.
    Applied { from: Status, to: Status },
    /// Same non-terminal status repeated; nothing to do.
    Unchanged(Status),
    /// Refused; the thread keeps its current status.
    Stale(StaleTransition),
}

impl Transition {
    /// The terminal status this transition entered, if any.
    pub fn entered_terminal(&self) -> Option<Status> {
        match self {
            Transition::Applied { to, .. } if to.is_terminal() => Some(*to),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Transition::Stale(_))
    }
}

/// Whether `from -> to` is a legal move.
///
/// `Initiated` may jump straight to a terminal status so an out-of-order
/// `Completed` that overtakes its `InProgress` still ends the thread.
pub fn is_legal(from: Status, to: Status) -> bool {
    match from {
        Status::Initiated => !matches!(to, Status::Initiated),
        Status::InProgress => to.is_terminal(),
        Status::Completed | Status::Failed | Status::Error => false,
    }
}

/// Decide what offering `attempted` to a thread at `current` does.
pub fn next(thread_id: &str, current: Status, attempted: Status) -> Transition {
    if current == attempted && !current.is_terminal() {
        return Transition::Unchanged(current);
    }
    if is_legal(current, attempted) {
        Transition::Applied {
            from: current,
            to: attempted,
        }
    } else {
        Transition::Stale(StaleTransition {
            thread_id: thread_id.to_string(),
            current,
            attempted,
        })
    }
}
