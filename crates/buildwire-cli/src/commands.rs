// ABOUTME: Implementations behind the buildwire subcommands.
// ABOUTME: serve runs the default handlers; build and ask drive one thread; validate checks envelope files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use buildwire_client::{ConnectionError, ConnectionEvent, Session, WebSocketConnector};
use buildwire_core::{
    BuildwireConfig, CodeGenerationService, Collaborators, ContinuationOutcome, MemoryStore,
    NullCodeGenerator, ThreadEvent,
};
use buildwire_proto::{decode, Actor, Contract, DecodeError, Envelope, MessageType, Messages, Status};
use tokio::sync::broadcast;

use crate::generator::CommandCodeGenerator;
use crate::prompt::TerminalPrompt;
use crate::store::JsonlStore;

/// Per-invocation overrides applied on top of the loaded config.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub url: Option<String>,
    pub actor: Option<Actor>,
}

impl Overrides {
    pub fn apply(&self, config: &mut BuildwireConfig) {
        if let Some(url) = &self.url {
            config.connection.url = url.clone();
        }
        if let Some(actor) = self.actor {
            config.identity.actor = actor;
        }
    }
}

/// Load from an explicit path or the default location.
pub fn load_config(path: Option<&Path>) -> Result<BuildwireConfig> {
    match path {
        Some(path) => BuildwireConfig::load_from(path),
        None => BuildwireConfig::load(),
    }
}

fn connector(config: &BuildwireConfig) -> Result<Arc<WebSocketConnector>> {
    let connector = WebSocketConnector::new(&config.connection.url)
        .with_context(|| format!("bad server url '{}'", config.connection.url))?;
    Ok(Arc::new(connector))
}

fn abandoned(err: ConnectionError) -> anyhow::Error {
    anyhow::Error::new(err).context("lost the server for good")
}

/// Run a long-lived session answering requests with the configured collaborators.
pub async fn serve(config: BuildwireConfig) -> Result<()> {
    let generator: Arc<dyn CodeGenerationService> =
        match CommandCodeGenerator::from_config(&config.generator) {
            Some(generator) => Arc::new(generator),
            None => {
                tracing::warn!("no generator.command configured, builds will be reported failed");
                Arc::new(NullCodeGenerator)
            }
        };
    let collaborators = Collaborators {
        generator,
        store: Arc::new(JsonlStore::new(config.store_path())),
        prompt: Arc::new(TerminalPrompt::stdin()),
    };

    let session = Session::start(&config, connector(&config)?, collaborators);
    tracing::info!(
        url = %config.connection.url,
        actor = %config.identity.actor,
        session_id = %session.session_id(),
        "serving"
    );

    tokio::spawn(log_thread_events(session.thread_events()));

    let shutdown = session.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    session.wait().await.map_err(abandoned)
}

async fn log_thread_events(mut events: broadcast::Receiver<ThreadEvent>) {
    loop {
        match events.recv().await {
            Ok(ThreadEvent::Transitioned {
                thread_id,
                from,
                to,
                details,
            }) => tracing::info!(%thread_id, %from, %to, details = ?details, "thread transitioned"),
            Ok(ThreadEvent::Archived { thread_id, status }) => {
                tracing::info!(%thread_id, %status, "thread archived")
            }
            Ok(other) => tracing::debug!(event = ?other, "thread event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "thread event log lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Request a build as the user and report transitions until the thread ends.
pub async fn build(
    mut config: BuildwireConfig,
    description: &str,
    requirements: &[String],
) -> Result<Status> {
    config.identity.actor = Actor::User;
    let collaborators = Collaborators {
        prompt: Arc::new(TerminalPrompt::stdin()),
        store: Arc::new(MemoryStore::default()),
        ..Collaborators::default()
    };
    let session = Session::start(&config, connector(&config)?, collaborators);
    let mut events = session.thread_events();
    let mut connection = session.connection_events();

    session
        .connection()
        .wait_connected()
        .await
        .context("could not reach the server")?;

    let contract = requirements
        .iter()
        .fold(Contract::describe(description), |c, r| c.with_requirement(r.clone()));
    let request = Envelope::start(Actor::User, MessageType::BuildFeature)
        .with_status(Status::Initiated)
        .with_contract(contract);
    let thread_id = request.thread_id.clone();
    println!("thread {thread_id}: {}", Status::Initiated);

    let _pending = session.request(request, None).await?;

    let status = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ThreadEvent::Transitioned { thread_id: id, to, details, .. }) if id == thread_id => {
                    match details {
                        Some(details) => println!("thread {id}: {to} ({details})"),
                        None => println!("thread {id}: {to}"),
                    }
                    if to.is_terminal() {
                        break to;
                    }
                }
                Ok(ThreadEvent::ClarificationRequested { thread_id: id, .. }) if id == thread_id => {
                    println!("thread {id}: waiting for clarification");
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("session ended before the build finished"),
            },
            event = connection.recv() => {
                if let Ok(ConnectionEvent::Abandoned { attempts }) = event {
                    return Err(abandoned(ConnectionError::ReconnectAbandoned { attempts }));
                }
            }
        }
    };

    session.shutdown().await.map_err(abandoned)?;
    Ok(status)
}

/// Ask a question and return the answer text.
pub async fn ask(mut config: BuildwireConfig, question: &str, timeout: Duration) -> Result<String> {
    config.identity.actor = Actor::User;
    let session = Session::start(&config, connector(&config)?, Collaborators::default());
    session
        .connection()
        .wait_connected()
        .await
        .context("could not reach the server")?;

    let envelope = Envelope::start(Actor::User, MessageType::QuestionToAi)
        .with_messages(Messages::question(question));
    let outcome = session.ask(envelope, Some(timeout)).await;
    session.shutdown().await.map_err(abandoned)?;

    match outcome? {
        ContinuationOutcome::Reply(reply) => answer_text(&reply),
        ContinuationOutcome::Timeout { .. } => {
            bail!("no answer within {}s", timeout.as_secs())
        }
        ContinuationOutcome::Cancelled { reason } => bail!("question cancelled: {reason}"),
    }
}

fn answer_text(reply: &Envelope) -> Result<String> {
    if let Some(text) = reply
        .body
        .messages
        .as_ref()
        .and_then(|m| m.response.as_deref())
    {
        return Ok(text.to_string());
    }
    match reply.details() {
        Some(details) => bail!("server could not answer: {details}"),
        None => bail!("reply {} carried no answer", reply.message_id),
    }
}

/// Decode one envelope or a JSON array of envelopes.
pub fn validate_bytes(bytes: &[u8]) -> Vec<Result<Envelope, DecodeError>> {
    let is_array = bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'[');
    if !is_array {
        return vec![decode(bytes)];
    }

    match serde_json::from_slice::<Vec<serde_json::Value>>(bytes) {
        Ok(items) => items
            .into_iter()
            .map(|item| decode(item.to_string().as_bytes()))
            .collect(),
        Err(e) => vec![Err(DecodeError::MalformedPayload(e.to_string()))],
    }
}

/// Validate a file and render one report line per envelope. Returns the lines and
/// whether every envelope was valid.
pub fn validate_file(path: &Path) -> Result<(Vec<String>, bool)> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut all_valid = true;
    let lines = validate_bytes(&bytes)
        .into_iter()
        .enumerate()
        .map(|(n, result)| match result {
            Ok(env) => format!(
                "#{n}: ok {} {} thread={} message={}",
                env.kind, env.actor, env.thread_id, env.message_id
            ),
            Err(e) => {
                all_valid = false;
                format!("#{n}: invalid: {e}")
            }
        })
        .collect();
    Ok((lines, all_valid))
}
