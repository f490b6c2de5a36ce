// ABOUTME: Protocol engine for buildwire threads: lifecycle, correlation, delivery and dispatch.
// ABOUTME: Transport-agnostic; buildwire-client supplies the connection through Transmit.

pub mod backoff;
pub mod collaborators;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod outbox;
pub mod retry;
pub mod state;
pub mod table;
pub mod thread;

pub use backoff::Backoff;
pub use collaborators::{
    BuildReport, CodeGenerationService, Collaborators, MemoryStore, NoPrompt, NullCodeGenerator,
    PersistenceStore, StaticPrompt, UserPrompt,
};
pub use config::BuildwireConfig;
pub use correlation::{ContinuationOutcome, Correlation, PendingReply};
pub use dispatcher::{
    Dispatcher, HandleOutcome, HandlerContext, HandlerRegistry, MessageHandler, TransitionRequest,
};
pub use engine::{Ingested, ProtocolEngine};
pub use error::ProtocolError;
pub use events::ThreadEvent;
pub use handlers::default_registry;
pub use outbox::Outbox;
pub use retry::{Retrier, RetryPolicy, Transmit};
pub use state::{StaleTransition, Transition};
pub use thread::{Direction, Observation, ThreadSnapshot};
