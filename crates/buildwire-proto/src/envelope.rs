// ABOUTME: The protocol envelope and its closed enumerations (actor, message type, status).
// ABOUTME: Includes constructors for fresh threads, follow-ups, replies and heartbeats.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::body::{Body, Contract, Messages, StatusDetails};
use crate::codec::PROTOCOL_VERSION;
use crate::error::DecodeError;

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    System,
    User,
    Coder,
}

impl Actor {
    pub const ALL: [Actor; 3] = [Actor::System, Actor::User, Actor::Coder];

    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::System => "System",
            Actor::User => "User",
            Actor::Coder => "Coder",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Actor::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DecodeError::MalformedPayload(format!("unknown actor `{s}`")))
    }
}

/// Message discriminator carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    BuildFeature,
    QuestionToAi,
    ClarificationNeededFromUser,
    StatusUpdate,
    Heartbeat,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::BuildFeature,
        MessageType::QuestionToAi,
        MessageType::ClarificationNeededFromUser,
        MessageType::StatusUpdate,
        MessageType::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::BuildFeature => "build_feature",
            MessageType::QuestionToAi => "question_to_ai",
            MessageType::ClarificationNeededFromUser => "clarification_needed_from_user",
            MessageType::StatusUpdate => "status_update",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    /// Whether a fresh message of this type waits for an answer.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageType::BuildFeature
                | MessageType::QuestionToAi
                | MessageType::ClarificationNeededFromUser
        )
    }

    /// Whether the `status` of this type may move the thread state machine.
    pub fn drives_lifecycle(&self) -> bool {
        matches!(self, MessageType::BuildFeature | MessageType::StatusUpdate)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// Lifecycle status of a build or question thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Initiated,
    InProgress,
    Completed,
    Failed,
    Error,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Initiated,
        Status::InProgress,
        Status::Completed,
        Status::Failed,
        Status::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initiated => "Initiated",
            Status::InProgress => "InProgress",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            Status::Error => "Error",
        }
    }

    /// Completed, Failed and Error end a thread's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DecodeError::MalformedPayload(format!("unknown status `{s}`")))
    }
}

/// Correlation metadata.
///
/// `origin_*` names the message that opened the thread and never changes.
/// `responding_to_*` names the message this one answers and is absent on
/// fresh, unsolicited messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub origin_message_id: String,
    pub origin_actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responding_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responding_to_actor: Option<Actor>,
}

impl Origin {
    /// Origin of a message that opens its own thread.
    pub fn opening(message_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            origin_message_id: message_id.into(),
            origin_actor: actor,
            responding_to_message_id: None,
            responding_to_actor: None,
        }
    }
}

/// One wire-format message instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: String,
    pub message_id: String,
    pub thread_id: String,
    pub actor: Actor,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    #[serde(default)]
    pub body: Body,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Envelope {
    /// Open a new thread with a generated thread id.
    pub fn start(actor: Actor, kind: MessageType) -> Self {
        Self::start_in(new_message_id(), actor, kind)
    }

    /// Open a new thread under a caller-chosen thread id.
    pub fn start_in(thread_id: impl Into<String>, actor: Actor, kind: MessageType) -> Self {
        let message_id = new_message_id();
        Self {
            version: PROTOCOL_VERSION.to_string(),
            origin: Origin::opening(message_id.clone(), actor),
            message_id,
            thread_id: thread_id.into(),
            actor,
            kind,
            status: None,
            timestamp: Utc::now(),
            body: Body::default(),
        }
    }

    /// A fresh message on the same thread that answers nothing in particular.
    pub fn follow_up(&self, actor: Actor, kind: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            message_id: new_message_id(),
            thread_id: self.thread_id.clone(),
            actor,
            kind,
            status: None,
            timestamp: Utc::now(),
            origin: Origin {
                origin_message_id: self.origin.origin_message_id.clone(),
                origin_actor: self.origin.origin_actor,
                responding_to_message_id: None,
                responding_to_actor: None,
            },
            body: Body::default(),
        }
    }

    /// A message on the same thread answering `self`.
    pub fn reply_to(&self, actor: Actor, kind: MessageType) -> Self {
        let mut reply = self.follow_up(actor, kind);
        reply.origin.responding_to_message_id = Some(self.message_id.clone());
        reply.origin.responding_to_actor = Some(self.actor);
        reply
    }

    /// Connection-level liveness message. `session_id` stands in for the thread id.
    pub fn heartbeat(session_id: impl Into<String>, actor: Actor) -> Self {
        Self::start_in(session_id, actor, MessageType::Heartbeat)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.body.contract = Some(contract);
        self
    }

    pub fn with_messages(mut self, messages: Messages) -> Self {
        self.body.messages = Some(messages);
        self
    }

    pub fn with_status_details(mut self, details: StatusDetails) -> Self {
        self.body.status_details = Some(details);
        self
    }

    /// The id of the message this one answers, if any.
    pub fn responding_to(&self) -> Option<&str> {
        self.origin.responding_to_message_id.as_deref()
    }

    pub fn is_response(&self) -> bool {
        self.origin.responding_to_message_id.is_some()
    }

    /// A fresh message of a type that waits for an answer.
    pub fn expects_reply(&self) -> bool {
        !self.is_response() && self.kind.expects_reply()
    }

    /// Human-readable details from whichever body variant carries them.
    pub fn details(&self) -> Option<&str> {
        self.body
            .status_details
            .as_ref()
            .and_then(|d| d.details.as_deref())
            .or_else(|| {
                self.body
                    .contract
                    .as_ref()
                    .and_then(|c| c.status_details.as_ref())
                    .and_then(|d| d.details.as_deref())
            })
    }
}
