// ABOUTME: Outbound path: record on the thread, register any continuation, then deliver with retry.
// ABOUTME: Exhausted responses and build requests move their thread to Error.

use std::sync::Arc;
use std::time::Duration;

use buildwire_proto::{encode, Envelope, MessageType};
use tracing::{error, warn};

use crate::correlation::{ContinuationOutcome, PendingReply};
use crate::engine::ProtocolEngine;
use crate::error::ProtocolError;
use crate::retry::{Retrier, Transmit};

#[derive(Clone)]
pub struct Outbox {
    engine: Arc<ProtocolEngine>,
    retrier: Retrier,
    transmit: Arc<dyn Transmit>,
}

impl Outbox {
    pub fn new(engine: Arc<ProtocolEngine>, retrier: Retrier, transmit: Arc<dyn Transmit>) -> Self {
        Self {
            engine,
            retrier,
            transmit,
        }
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Send an envelope that waits for no reply.
    pub async fn send(&self, env: Envelope) -> Result<(), ProtocolError> {
        let frame = encode(&env)?;
        self.engine.record_outbound(&env).await?;
        self.deliver(&env, frame).await?;
        self.engine.delivered(&env.thread_id).await;
        Ok(())
    }

    /// Send a request and return the handle to its reply.
    ///
    /// The continuation is registered before the first send attempt, so a
    /// reply can never arrive ahead of it.
    pub async fn request(
        &self,
        env: Envelope,
        deadline: Option<Duration>,
    ) -> Result<PendingReply, ProtocolError> {
        let frame = encode(&env)?;
        let (_, pending) = self.engine.register_request(&env, deadline).await?;

        if let Err(e) = self.deliver(&env, frame).await {
            self.engine
                .cancel_continuation(&env.thread_id, &env.message_id, &e.to_string())
                .await;
            return Err(e);
        }
        Ok(pending)
    }

    /// Send a request and wait for its outcome.
    pub async fn ask(
        &self,
        env: Envelope,
        deadline: Option<Duration>,
    ) -> Result<ContinuationOutcome, ProtocolError> {
        Ok(self.request(env, deadline).await?.wait().await)
    }

    async fn deliver(&self, env: &Envelope, frame: Vec<u8>) -> Result<(), ProtocolError> {
        let err = match self
            .retrier
            .deliver(self.transmit.as_ref(), &env.message_id, frame)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        error!(
            thread_id = %env.thread_id,
            message_id = %env.message_id,
            kind = %env.kind,
            error = %err,
            "delivery failed"
        );

        if env.is_response() || env.kind == MessageType::BuildFeature {
            if let Err(e) = self.engine.fail_thread(&env.thread_id, err.to_string()).await {
                warn!(thread_id = %env.thread_id, error = %e, "could not fail thread");
            }
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::collaborators::MemoryStore;
    use crate::config::BuildwireConfig;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use buildwire_proto::{decode, Actor, Messages, Status};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
        down: bool,
    }

    #[async_trait]
    impl Transmit for Recorder {
        async fn transmit(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
            if self.down {
                return Err(ProtocolError::NotConnected);
            }
            self.frames.lock().await.push(frame);
            Ok(())
        }
    }

    fn outbox(down: bool) -> (Outbox, Arc<Recorder>) {
        let engine = ProtocolEngine::new(
            &BuildwireConfig::default(),
            Arc::new(MemoryStore::default()),
        );
        let recorder = Arc::new(Recorder {
            down,
            ..Default::default()
        });
        let retrier = Retrier::new(RetryPolicy::new(
            3,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        ));
        (Outbox::new(engine, retrier, recorder.clone()), recorder)
    }

    #[tokio::test]
    async fn test_send_records_then_transmits() {
        let (outbox, recorder) = outbox(false);
        let request = Envelope::start(Actor::User, MessageType::BuildFeature)
            .with_status(Status::Initiated);
        let pending = outbox.request(request.clone(), None).await.unwrap();
        assert_eq!(pending.message_id(), request.message_id);

        let frames = recorder.frames.lock().await;
        assert_eq!(decode(&frames[0]).unwrap(), request);

        let snapshot = outbox.engine().snapshot(&request.thread_id).await.unwrap();
        assert_eq!(snapshot.outstanding, vec![request.message_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_build_request_fails_thread() {
        let (outbox, _) = outbox(true);
        let request = Envelope::start(Actor::User, MessageType::BuildFeature)
            .with_status(Status::Initiated);

        let err = outbox.request(request.clone(), None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::DeliveryExhausted { attempts: 3, .. }));

        // Error is terminal and the cancelled continuation lets it archive
        let snapshot = outbox.engine().snapshot(&request.thread_id).await.unwrap();
        assert_eq!(snapshot.status, Status::Error);
        assert!(snapshot.outstanding.is_empty());
        let local = snapshot.log.last().unwrap();
        assert!(local.envelope.details().unwrap().contains("exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_response_fails_thread() {
        let (outbox, _) = outbox(true);
        let question = Envelope::start(Actor::User, MessageType::QuestionToAi)
            .with_messages(Messages::question("what stack?"));
        outbox.engine().ingest(&question).await;

        let answer = question
            .reply_to(Actor::Coder, MessageType::QuestionToAi)
            .with_messages(Messages::response("rust"));
        assert!(outbox.send(answer).await.is_err());
        assert_eq!(
            outbox.engine().status(&question.thread_id).await,
            Some(Status::Error)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_notification_leaves_thread() {
        let (outbox, _) = outbox(true);
        let question = Envelope::start(Actor::User, MessageType::QuestionToAi);
        let err = outbox.request(question.clone(), None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::DeliveryExhausted { .. }));
        assert_eq!(
            outbox.engine().status(&question.thread_id).await,
            Some(Status::Initiated)
        );
    }

    #[tokio::test]
    async fn test_delivered_answer_archives_question() {
        let (outbox, _) = outbox(false);
        let question = Envelope::start(Actor::User, MessageType::QuestionToAi)
            .with_messages(Messages::question("what stack?"));
        outbox.engine().ingest(&question).await;

        let answer = question
            .reply_to(Actor::Coder, MessageType::QuestionToAi)
            .with_messages(Messages::response("rust"));
        outbox.send(answer).await.unwrap();
        assert_eq!(outbox.engine().thread_counts().await, (0, 1));
    }

    #[tokio::test]
    async fn test_duplicate_send_rejected_without_transmit() {
        let (outbox, recorder) = outbox(false);
        let update = Envelope::start(Actor::Coder, MessageType::StatusUpdate);
        outbox.send(update.clone()).await.unwrap();
        assert!(matches!(
            outbox.send(update).await,
            Err(ProtocolError::DuplicateMessage { .. })
        ));
        assert_eq!(recorder.frames.lock().await.len(), 1);
    }
}
