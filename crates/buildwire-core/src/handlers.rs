// ABOUTME: Default handlers for each message type, backed by the session's collaborators.
// ABOUTME: Builds, answers and human prompts run as spawned tasks so thread workers stay free.

use std::sync::Arc;

use async_trait::async_trait;
use buildwire_proto::{Actor, Envelope, MessageType, Messages, Status, StatusDetails};
use tracing::{debug, error, info, warn};

use crate::collaborators::{BuildReport, CodeGenerationService, Collaborators, UserPrompt};
use crate::correlation::Correlation;
use crate::dispatcher::{HandleOutcome, HandlerContext, HandlerRegistry, MessageHandler};
use crate::error::ProtocolError;
use crate::outbox::Outbox;

/// Registry with a handler for every threaded message type.
pub fn default_registry(collaborators: &Collaborators) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            MessageType::BuildFeature,
            Arc::new(BuildFeatureHandler::new(collaborators.generator.clone())),
        )
        .with(
            MessageType::QuestionToAi,
            Arc::new(QuestionHandler::new(collaborators.generator.clone())),
        )
        .with(
            MessageType::ClarificationNeededFromUser,
            Arc::new(ClarificationHandler::new(collaborators.prompt.clone())),
        )
        .with(MessageType::StatusUpdate, Arc::new(StatusUpdateHandler))
}

/// Accepts a build: acknowledges with `InProgress`, then reports the
/// generator's result as `Completed` or `Failed`.
pub struct BuildFeatureHandler {
    generator: Arc<dyn CodeGenerationService>,
}

impl BuildFeatureHandler {
    pub fn new(generator: Arc<dyn CodeGenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl MessageHandler for BuildFeatureHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        env: &Envelope,
    ) -> Result<HandleOutcome, ProtocolError> {
        if ctx.observation.correlation != Correlation::Fresh {
            debug!(thread_id = %env.thread_id, "build_feature reply needs no action");
            return Ok(HandleOutcome::ok());
        }

        let ack = env
            .reply_to(ctx.local_actor(), MessageType::StatusUpdate)
            .with_status(Status::InProgress)
            .with_status_details(StatusDetails::with_details("build accepted"));
        ctx.outbox.send(ack).await?;

        // A duplicate or already-finished thread refuses the InProgress ack.
        if ctx.engine().status(&env.thread_id).await != Some(Status::InProgress) {
            warn!(thread_id = %env.thread_id, "build not started, thread is not in progress");
            return Ok(HandleOutcome::ok());
        }

        info!(
            thread_id = %env.thread_id,
            description = env.body.contract.as_ref().and_then(|c| c.description()).unwrap_or(""),
            "build started"
        );
        tokio::spawn(run_build(
            self.generator.clone(),
            ctx.outbox.clone(),
            env.clone(),
            ctx.local_actor(),
        ));
        Ok(HandleOutcome::ok())
    }
}

async fn run_build(
    generator: Arc<dyn CodeGenerationService>,
    outbox: Outbox,
    request: Envelope,
    actor: Actor,
) {
    let contract = request.body.contract.clone().unwrap_or_default();
    let report = match generator.handle_build_request(contract).await {
        Ok(report) => report,
        Err(e) => BuildReport::failed(format!("{e:#}")),
    };

    let status = if report.success {
        Status::Completed
    } else {
        Status::Failed
    };
    let result = request
        .reply_to(actor, MessageType::StatusUpdate)
        .with_status(status)
        .with_status_details(report.status_details());

    if let Err(e) = outbox.send(result).await {
        error!(thread_id = %request.thread_id, error = %e, "failed to report build result");
    }
}

/// Answers fresh questions through the generator; logs answers to our own.
pub struct QuestionHandler {
    generator: Arc<dyn CodeGenerationService>,
}

impl QuestionHandler {
    pub fn new(generator: Arc<dyn CodeGenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl MessageHandler for QuestionHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        env: &Envelope,
    ) -> Result<HandleOutcome, ProtocolError> {
        match &ctx.observation.correlation {
            Correlation::Fresh => {
                tokio::spawn(answer(
                    self.generator.clone(),
                    ctx.outbox.clone(),
                    env.clone(),
                    ctx.local_actor(),
                ));
            }
            Correlation::Response { request_id } => {
                info!(thread_id = %env.thread_id, request_id = %request_id, "answer received");
            }
            Correlation::Unmatched { responding_to } => {
                warn!(
                    thread_id = %env.thread_id,
                    responding_to = %responding_to,
                    "answer arrived after its question expired"
                );
            }
            Correlation::Notification => {}
        }
        Ok(HandleOutcome::ok())
    }
}

async fn answer(
    generator: Arc<dyn CodeGenerationService>,
    outbox: Outbox,
    question: Envelope,
    actor: Actor,
) {
    let text = question
        .body
        .messages
        .as_ref()
        .and_then(|m| m.question.as_deref());

    let reply = question.reply_to(actor, MessageType::QuestionToAi);
    let reply = match text {
        None => reply.with_status_details(StatusDetails::with_details(
            "question_to_ai carried no question",
        )),
        Some(text) => match generator.answer_question(text).await {
            Ok(response) => reply.with_messages(Messages::response(response)),
            Err(e) => {
                warn!(thread_id = %question.thread_id, error = %e, "could not answer question");
                reply.with_status_details(StatusDetails::with_details(format!(
                    "could not answer: {e:#}"
                )))
            }
        },
    };

    if let Err(e) = outbox.send(reply).await {
        error!(thread_id = %question.thread_id, error = %e, "failed to send answer");
    }
}

/// Puts clarification requests to the user and replies with their answer.
pub struct ClarificationHandler {
    prompt: Arc<dyn UserPrompt>,
}

impl ClarificationHandler {
    pub fn new(prompt: Arc<dyn UserPrompt>) -> Self {
        Self { prompt }
    }
}

#[async_trait]
impl MessageHandler for ClarificationHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        env: &Envelope,
    ) -> Result<HandleOutcome, ProtocolError> {
        match &ctx.observation.correlation {
            Correlation::Fresh => {
                tokio::spawn(clarify(self.prompt.clone(), ctx.outbox.clone(), env.clone()));
            }
            Correlation::Response { .. } => {
                info!(thread_id = %env.thread_id, "clarification answered");
            }
            Correlation::Unmatched { .. } | Correlation::Notification => {
                debug!(thread_id = %env.thread_id, "clarification message needs no action");
            }
        }
        Ok(HandleOutcome::ok())
    }
}

async fn clarify(prompt: Arc<dyn UserPrompt>, outbox: Outbox, request: Envelope) {
    let question = request
        .body
        .messages
        .as_ref()
        .and_then(Messages::prompt_text)
        .unwrap_or("Clarification requested");

    match prompt.ask(question).await {
        Ok(text) => {
            let reply = request
                .reply_to(Actor::User, MessageType::ClarificationNeededFromUser)
                .with_messages(Messages::response(text));
            if let Err(e) = outbox.send(reply).await {
                error!(thread_id = %request.thread_id, error = %e, "failed to send clarification");
            }
        }
        Err(e) => warn!(
            thread_id = %request.thread_id,
            error = %e,
            "clarification left unanswered"
        ),
    }
}

/// Logs progress; the state change itself already happened on ingest.
pub struct StatusUpdateHandler;

#[async_trait]
impl MessageHandler for StatusUpdateHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        env: &Envelope,
    ) -> Result<HandleOutcome, ProtocolError> {
        info!(
            thread_id = %env.thread_id,
            actor = %env.actor,
            status = ?env.status,
            thread_status = %ctx.observation.status,
            details = env.details().unwrap_or(""),
            "status update"
        );
        Ok(HandleOutcome::ok())
    }
}
