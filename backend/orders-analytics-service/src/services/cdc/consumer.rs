use std::future::Future;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{ConsumerError, Result};

use super::applier::{ApplyError, ApplyOutcome, MutationApplier, OrderStore};
use super::models::decode;

/// Consecutive poll errors before the consumer is logged as unhealthy.
const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Consecutive poll errors before escalating to a critical report.
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

/// One poll against the subscription.
enum Polled<'a> {
    Record(BorrowedMessage<'a>),
    /// Poll timeout elapsed with nothing to deliver.
    NoRecord,
    /// Broker-reported recoverable error (rebalance, transport hiccup).
    Transient(KafkaError),
}

/// Orchestration-loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    Draining,
    Stopped,
}

/// Per-record result consumed by the loop. Every variant advances the
/// offset; the fatal store path returns an error instead and leaves the
/// offset alone so the record redelivers.
#[derive(Debug, PartialEq)]
enum RecordOutcome {
    Applied(ApplyOutcome),
    /// Undecodable payload; committed past so it cannot stall the partition.
    Malformed,
    /// Well-formed event carrying bad data; committed past with no mutation.
    Rejected,
}

/// Bounded retry for store writes.
///
/// Exhaustion is fatal for the loop: the offset is not committed, so the
/// record redelivers after a restart instead of being silently dropped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Exponential backoff: min * 2^(attempt-1), capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Consecutive transient-error tracking for the poll loop, with the same
/// exponential shape as [`RetryPolicy`] but reset on any successful poll.
struct ErrorBackoff {
    consecutive: u32,
    min: Duration,
    max: Duration,
}

impl ErrorBackoff {
    fn new() -> Self {
        Self {
            consecutive: 0,
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Record an error and return the delay before the next poll.
    fn record_error(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        let factor = 2u32.saturating_pow(self.consecutive.saturating_sub(1));
        self.min.saturating_mul(factor).min(self.max)
    }

    fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// CDC consumer for the orders topic.
///
/// Pulls one record at a time, decodes it, applies the effect, and only
/// then advances the consumer-group offset. A crash between apply and
/// commit redelivers the record; both mutations are idempotent, so replay
/// converges to the same store state.
pub struct CdcConsumer<S> {
    consumer: StreamConsumer,
    applier: MutationApplier<S>,
    poll_timeout: Duration,
    retry: RetryPolicy,
}

impl<S: OrderStore> CdcConsumer<S> {
    /// Establish group membership and the topic subscription.
    ///
    /// Fails fast when the broker configuration is rejected; the position
    /// falls back to the earliest retained record when the group has no
    /// committed offset.
    pub fn new(
        config: &KafkaConfig,
        applier: MutationApplier<S>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("enable.auto.commit", "false") // the loop owns offset advancement
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!(topic = %config.topic, group = %config.group_id, "subscribed to CDC topic");

        Ok(Self {
            consumer,
            applier,
            poll_timeout: config.poll_timeout,
            retry,
        })
    }

    /// Drive the loop until the shutdown future resolves or a fatal error.
    ///
    /// The signal is only honored between records: the select below races
    /// it against the poll, and the apply/commit pair runs to completion
    /// before the next iteration, so no mutation is ever abandoned midway.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut backoff = ErrorBackoff::new();
        let mut state = LoopState::Running;
        tokio::pin!(shutdown);

        info!("consumer loop started");
        while state == LoopState::Running {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown signal received, draining");
                    state = LoopState::Draining;
                }
                polled = self.poll() => match polled {
                    Polled::Record(msg) => {
                        backoff.record_success();
                        self.handle_record(&msg).await?;
                    }
                    Polled::NoRecord => {}
                    Polled::Transient(e) => {
                        let delay = backoff.record_error();
                        let consecutive = backoff.consecutive();
                        if consecutive >= CRITICAL_ERROR_THRESHOLD {
                            error!(
                                consecutive,
                                backoff_secs = delay.as_secs(),
                                "persistent Kafka failures, manual intervention may be required: {e}"
                            );
                        } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
                            warn!(
                                consecutive,
                                backoff_secs = delay.as_secs(),
                                "consumer unhealthy, repeated Kafka errors: {e}"
                            );
                        } else {
                            warn!(consecutive, "transient Kafka error, will retry: {e}");
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // Draining: the select above never interrupts an in-flight record,
        // so there is nothing left to finish before releasing the handles.
        state = LoopState::Stopped;
        info!(state = ?state, "consumer loop stopped");
        Ok(())
    }

    async fn poll(&self) -> Polled<'_> {
        match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Ok(Ok(msg)) => Polled::Record(msg),
            Ok(Err(e)) => Polled::Transient(e),
            Err(_elapsed) => Polled::NoRecord,
        }
    }

    /// Decode and apply one record, then advance past it.
    ///
    /// Skippable failures (malformed payload, poison-pill data) are still
    /// committed; an exhausted store retry propagates instead and leaves
    /// the offset where it was.
    async fn handle_record(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        let partition = msg.partition();
        let offset = msg.offset();
        debug!(topic = msg.topic(), partition, offset, "received record");

        let outcome = apply_record(&self.applier, msg.payload(), &self.retry).await?;
        match outcome {
            RecordOutcome::Applied(ApplyOutcome::Upserted { id }) => {
                info!(id, partition, offset, "upserted order");
            }
            RecordOutcome::Applied(ApplyOutcome::Deleted { id }) => {
                info!(id, partition, offset, "deleted order");
            }
            RecordOutcome::Applied(ApplyOutcome::Skipped) => {
                debug!(partition, offset, "unrecognized event, no mutation");
            }
            RecordOutcome::Malformed | RecordOutcome::Rejected => {
                debug!(partition, offset, "record skipped");
            }
        }

        // The delivery-safety contract: commit strictly after the effect is
        // durable (or the record is classified skippable).
        if let Err(e) = self.consumer.commit_message(msg, CommitMode::Async) {
            warn!(partition, offset, "offset commit failed, record may redeliver: {e}");
        }

        Ok(())
    }
}

/// One record's processing pipeline: decode, apply, retry store failures
/// with backoff, classify everything else as committable.
async fn apply_record<S: OrderStore>(
    applier: &MutationApplier<S>,
    payload: Option<&[u8]>,
    retry: &RetryPolicy,
) -> Result<RecordOutcome> {
    let Some(raw) = payload else {
        warn!("record without payload, skipping");
        return Ok(RecordOutcome::Malformed);
    };

    let event = match decode(raw) {
        Ok(event) => event,
        Err(e) => {
            warn!("undecodable record, skipping: {e}");
            return Ok(RecordOutcome::Malformed);
        }
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match applier.apply(&event).await {
            Ok(outcome) => return Ok(RecordOutcome::Applied(outcome)),
            Err(e @ ApplyError::InvalidField { .. }) => {
                warn!("rejecting event with invalid data, no mutation applied: {e}");
                return Ok(RecordOutcome::Rejected);
            }
            Err(ApplyError::Store(source)) => {
                if attempt >= retry.max_attempts {
                    return Err(ConsumerError::StoreUnavailable {
                        attempts: attempt,
                        source,
                    });
                }
                let delay = retry.backoff(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "store write failed, backing off: {source}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cdc::test_store::MemoryStore;
    use serde_json::json;

    fn immediate_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn create_event(id: i64, status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "payload": {
                "op": "c",
                "before": null,
                "after": {
                    "id": id,
                    "customer_id": 9,
                    "customer_name": "A",
                    "total": 12.5,
                    "status": status,
                    "created_at": "2024-01-01T00:00:00Z",
                },
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_record_does_not_stall_the_stream() {
        let store = MemoryStore::default();
        let applier = MutationApplier::new(store.clone());
        let retry = immediate_retry(3);

        let bad = apply_record(&applier, Some(b"{not json"), &retry).await.unwrap();
        assert_eq!(bad, RecordOutcome::Malformed);

        let good = apply_record(&applier, Some(&create_event(1, "paid")), &retry)
            .await
            .unwrap();
        assert_eq!(
            good,
            RecordOutcome::Applied(ApplyOutcome::Upserted { id: 1 })
        );

        // Exactly one mutation, and both records ended up committable.
        assert_eq!(store.calls(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_payload_is_skipped() {
        let store = MemoryStore::default();
        let applier = MutationApplier::new(store.clone());

        let outcome = apply_record(&applier, None, &immediate_retry(3)).await.unwrap();

        assert_eq!(outcome, RecordOutcome::Malformed);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_total_is_rejected_without_mutation() {
        let store = MemoryStore::default();
        let applier = MutationApplier::new(store.clone());
        let raw = serde_json::to_vec(&json!({
            "payload": { "op": "c", "after": { "id": 1, "total": "abc" } },
        }))
        .unwrap();

        let outcome = apply_record(&applier, Some(&raw), &immediate_retry(3))
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Rejected);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn unrecognized_event_still_advances() {
        let store = MemoryStore::default();
        let applier = MutationApplier::new(store.clone());
        let raw = serde_json::to_vec(&json!({
            "payload": { "op": "r", "before": null, "after": null },
        }))
        .unwrap();

        let outcome = apply_record(&applier, Some(&raw), &immediate_retry(3))
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Applied(ApplyOutcome::Skipped));
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn store_failure_retries_then_recovers() {
        let store = MemoryStore::failing(1);
        let applier = MutationApplier::new(store.clone());

        let outcome = apply_record(&applier, Some(&create_event(2, "paid")), &immediate_retry(3))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::Applied(ApplyOutcome::Upserted { id: 2 })
        );
        assert_eq!(store.calls(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_store_retries_are_fatal() {
        let store = MemoryStore::failing(10);
        let applier = MutationApplier::new(store.clone());

        let err = apply_record(&applier, Some(&create_event(3, "paid")), &immediate_retry(3))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::StoreUnavailable { attempts: 3, .. }
        ));
        assert_eq!(store.calls(), 3);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn poll_error_backoff_grows_and_caps() {
        let mut backoff = ErrorBackoff::new();

        assert_eq!(backoff.record_error(), Duration::from_secs(1));
        assert_eq!(backoff.record_error(), Duration::from_secs(2));
        assert_eq!(backoff.record_error(), Duration::from_secs(4));

        for _ in 0..10 {
            backoff.record_error();
        }
        assert_eq!(backoff.record_error(), Duration::from_secs(60));

        backoff.record_success();
        assert_eq!(backoff.record_error(), Duration::from_secs(1));
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        let retry = RetryPolicy::new(5);

        assert_eq!(retry.backoff(1), Duration::from_secs(1));
        assert_eq!(retry.backoff(2), Duration::from_secs(2));
        assert_eq!(retry.backoff(4), Duration::from_secs(8));
        assert_eq!(retry.backoff(30), Duration::from_secs(60));
    }
}
