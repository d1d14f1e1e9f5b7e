//! Durable delivery of proactive messages.
//!
//! [`OutboxProcessor::process`] makes one delivery attempt for one row and
//! decides its fate: acknowledge (delivered, poison, exhausted) or reschedule
//! with exponential backoff. [`poller::OutboxPoller`] feeds it due rows one at
//! a time.

pub mod poller;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::channel::MessageSender;
use crate::config::OutboxConfig;
use crate::store::{OutboxMessage, OutboxRepository};

/// Exponent cap for the backoff doubling.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// What happened to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Sent and acknowledged.
    Delivered,
    /// Recipient can never be reached; acknowledged without retrying.
    Poisoned,
    /// Retry budget spent; acknowledged and dropped.
    Exhausted,
    /// Rescheduled.
    Retrying {
        /// Failed attempts recorded so far.
        retry_count: u32,
        /// When the next attempt is due.
        next_retry_at: DateTime<Utc>,
    },
}

/// Backoff before attempt `retry_count + 1`: `base * 2^retry_count`.
pub fn retry_delay(base: Duration, retry_count: u32) -> chrono::Duration {
    let base_ms = i64::try_from(base.as_millis()).unwrap_or(i64::MAX);
    let factor = 1_i64
        .checked_shl(retry_count.min(MAX_BACKOFF_EXPONENT))
        .unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(base_ms.saturating_mul(factor))
        .unwrap_or(chrono::Duration::MAX)
}

/// Makes delivery attempts for outbox rows.
pub struct OutboxProcessor {
    repo: Arc<dyn OutboxRepository>,
    sender: Arc<dyn MessageSender>,
    base_delay: Duration,
}

impl std::fmt::Debug for OutboxProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("base_delay", &self.base_delay)
            .finish_non_exhaustive()
    }
}

impl OutboxProcessor {
    /// Create a processor with the given first-retry delay.
    pub fn new(
        repo: Arc<dyn OutboxRepository>,
        sender: Arc<dyn MessageSender>,
        base_delay: Duration,
    ) -> Self {
        Self {
            repo,
            sender,
            base_delay,
        }
    }

    /// Create a processor from the `[outbox]` config section.
    pub fn from_config(
        repo: Arc<dyn OutboxRepository>,
        sender: Arc<dyn MessageSender>,
        config: &OutboxConfig,
    ) -> Self {
        Self::new(repo, sender, Duration::from_millis(config.base_delay_ms))
    }

    /// The sender this processor delivers through.
    pub fn sender(&self) -> &Arc<dyn MessageSender> {
        &self.sender
    }

    /// Attempt delivery of `item` now.
    pub async fn process(&self, item: &OutboxMessage) -> ProcessOutcome {
        self.process_at(item, Utc::now()).await
    }

    /// Attempt delivery of `item`, computing any retry time from `now`.
    ///
    /// Repository failures are logged and never surface; a row whose
    /// acknowledgement failed is simply seen again on a later poll.
    pub async fn process_at(&self, item: &OutboxMessage, now: DateTime<Utc>) -> ProcessOutcome {
        let err = match self.sender.send_message(&item.user_id, &item.text).await {
            Ok(()) => {
                self.acknowledge(item.id).await;
                info!(id = item.id, channel = %item.channel, "outbox message delivered");
                return ProcessOutcome::Delivered;
            }
            Err(e) => e,
        };

        if err.is_permanent() {
            self.acknowledge(item.id).await;
            warn!(
                id = item.id,
                user_id = %item.user_id,
                error = %err,
                "dropping undeliverable outbox message"
            );
            return ProcessOutcome::Poisoned;
        }

        let retry_count = item.retry_count.saturating_add(1);
        if retry_count >= item.max_retries {
            self.acknowledge(item.id).await;
            error!(
                id = item.id,
                retry_count,
                max_retries = item.max_retries,
                error = %err,
                "max retries exceeded, dropping outbox message"
            );
            return ProcessOutcome::Exhausted;
        }

        let next_retry_at = now
            .checked_add_signed(retry_delay(self.base_delay, item.retry_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Err(e) = self.repo.mark_retry(item.id, retry_count, next_retry_at).await {
            error!(id = item.id, error = %e, "failed to reschedule outbox message");
        }
        warn!(
            id = item.id,
            retry_count,
            next_retry_at = %next_retry_at,
            error = %err,
            "outbox delivery failed, will retry"
        );
        ProcessOutcome::Retrying {
            retry_count,
            next_retry_at,
        }
    }

    async fn acknowledge(&self, id: i64) {
        if let Err(e) = self.repo.acknowledge(id).await {
            error!(id, error = %e, "failed to acknowledge outbox message");
        }
    }
}
