// ABOUTME: Thread lifecycle events broadcast by the engine.
// ABOUTME: Hosts subscribe to follow builds without touching the thread table.

use buildwire_proto::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    Created {
        thread_id: String,
    },
    Transitioned {
        thread_id: String,
        from: Status,
        to: Status,
        details: Option<String>,
    },
    Stale {
        thread_id: String,
        message_id: String,
        current: Status,
        attempted: Option<Status>,
    },
    ClarificationRequested {
        thread_id: String,
        message_id: String,
    },
    ClarificationAnswered {
        thread_id: String,
        message_id: String,
    },
    Archived {
        thread_id: String,
        status: Status,
    },
}

impl ThreadEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            ThreadEvent::Created { thread_id }
            | ThreadEvent::Transitioned { thread_id, .. }
            | ThreadEvent::Stale { thread_id, .. }
            | ThreadEvent::ClarificationRequested { thread_id, .. }
            | ThreadEvent::ClarificationAnswered { thread_id, .. }
            | ThreadEvent::Archived { thread_id, .. } => thread_id,
        }
    }

    /// The terminal status this event reports, if any.
    pub fn terminal_status(&self) -> Option<Status> {
        match self {
            ThreadEvent::Transitioned { to, .. } if to.is_terminal() => Some(*to),
            ThreadEvent::Archived { status, .. } => Some(*status),
            _ => None,
        }
    }
}
