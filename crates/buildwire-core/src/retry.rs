// ABOUTME: Bounded retry with exponential backoff around frame transmission.
// ABOUTME: The Transmit trait is the seam where the connection layer plugs in.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::ProtocolError;

/// Sends one encoded frame over whatever connection is current.
#[async_trait]
pub trait Transmit: Send + Sync {
    async fn transmit(&self, frame: Vec<u8>) -> Result<(), ProtocolError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Backoff::new(
                std::time::Duration::from_millis(200),
                std::time::Duration::from_secs(2),
            ),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Transmit `frame`, retrying with backoff. Returns the attempt that succeeded.
    pub async fn deliver(
        &self,
        transmit: &dyn Transmit,
        message_id: &str,
        frame: Vec<u8>,
    ) -> Result<u32, ProtocolError> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match transmit.transmit(frame.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(message_id = %message_id, attempt, "delivered after retry");
                    }
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(
                        message_id = %message_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "send failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff.delay(attempt)).await;
            }
        }

        Err(ProtocolError::DeliveryExhausted {
            message_id: message_id.to_string(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}
