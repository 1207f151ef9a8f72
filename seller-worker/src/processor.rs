use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common_amqp::{AmqpError, BatchItem, BatchProcessor, BrokerChannel};
use common_retry::{retry, RetryPolicy};
use common_types::{Seller, SellerCreatedEvent, ValidationError};
use tracing::{debug, error, info, warn};

use crate::store::{SellerStore, StoreError};

/// How long a failure is remembered when its email is not seen again.
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(600);

/// Where a single event ended up when persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Inserted,
    Updated,
    Unchanged,
    Invalid(ValidationError),
}

#[derive(Debug, Clone, Copy)]
struct FailureCount {
    attempts: u32,
    last_failed: Instant,
}

/// Persists batches of seller events. The fast path is one bulk insert of
/// every event whose email is not stored yet; a uniqueness conflict falls
/// back to reconciling events one at a time.
///
/// Batches that fail because the store is unavailable are always requeued.
/// Unclassified failures are counted against the emails of the batch, and
/// once an email reached `max_batch_attempts` its batch is settled item by
/// item instead, sending whatever still fails to the dead-letter queue.
///
/// Counts are local to this process and forgotten after `failure_ttl`
/// without a new failure, so emails settled by another replica do not
/// linger.
pub struct SellerBatchProcessor<S> {
    store: S,
    bulk_retry: RetryPolicy,
    max_batch_attempts: u32,
    failure_ttl: Duration,
    failures: Mutex<HashMap<String, FailureCount>>,
}

impl<S: SellerStore> SellerBatchProcessor<S> {
    pub fn new(store: S, bulk_retry: RetryPolicy, max_batch_attempts: u32) -> Self {
        Self {
            store,
            bulk_retry,
            max_batch_attempts: max_batch_attempts.max(1),
            failure_ttl: DEFAULT_FAILURE_TTL,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_failure_ttl(mut self, failure_ttl: Duration) -> Self {
        self.failure_ttl = failure_ttl;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Failed attempts recorded for `email` since it was last settled.
    pub fn failed_attempts(&self, email: &str) -> u32 {
        match self.failures().get(email) {
            Some(failure) if failure.last_failed.elapsed() < self.failure_ttl => failure.attempts,
            _ => 0,
        }
    }

    async fn handle(
        &self,
        batch: Vec<BatchItem<SellerCreatedEvent>>,
        channel: &dyn BrokerChannel,
    ) -> Result<(), AmqpError> {
        let Some(last_tag) = batch.last().map(|item| item.delivery_tag) else {
            return Ok(());
        };

        let emails = distinct_emails(&batch);
        let existing = match self.store.find_existing_emails(&emails).await {
            Ok(existing) => existing,
            Err(err) => return self.handle_failure(batch, channel, err).await,
        };

        let mut sellers = Vec::with_capacity(batch.len());
        let mut duplicates = 0;
        let mut invalid = 0;
        for item in &batch {
            let event = &item.message;
            if existing.contains(event.key()) {
                debug!(email = event.key(), "skipping existing seller");
                duplicates += 1;
                continue;
            }

            match Seller::import(event) {
                Ok(seller) => sellers.push(seller),
                Err(err) => {
                    warn!(email = event.key(), error = %err, "seller failed validation, dropping");
                    invalid += 1;
                }
            }
        }

        metrics::counter!("seller_worker_duplicates_skipped").increment(duplicates);
        metrics::counter!("seller_worker_invalid_events").increment(invalid);

        if sellers.is_empty() {
            channel.ack(last_tag, true).await?;
            self.settled(&emails);
            info!(
                size = batch.len(),
                duplicates, invalid, "nothing to insert, batch acknowledged"
            );
            return Ok(());
        }

        let inserted = retry(
            &self.bulk_retry,
            "bulk_insert",
            StoreError::is_transient,
            |_| self.store.bulk_insert(&sellers),
        )
        .await;

        match inserted {
            Ok(()) => {
                for item in &batch {
                    channel.ack(item.delivery_tag, false).await?;
                }
                self.settled(&emails);
                metrics::counter!("seller_worker_sellers_inserted").increment(sellers.len() as u64);
                info!(
                    size = batch.len(),
                    inserted = sellers.len(),
                    duplicates,
                    invalid,
                    "batch persisted"
                );
                Ok(())
            }
            Err(StoreError::Conflict(reason)) => {
                warn!(
                    size = batch.len(),
                    %reason,
                    "duplicate detected during bulk insert, reconciling one by one"
                );
                metrics::counter!("seller_worker_conflict_fallbacks").increment(1);
                self.reconcile_each(batch, channel).await
            }
            Err(err) => self.handle_failure(batch, channel, err).await,
        }
    }

    /// Persists each event on its own and acks it, whether or not that worked.
    async fn reconcile_each(
        &self,
        batch: Vec<BatchItem<SellerCreatedEvent>>,
        channel: &dyn BrokerChannel,
    ) -> Result<(), AmqpError> {
        for item in &batch {
            let email = item.message.key();
            match self.reconcile(&item.message).await {
                Ok(outcome) => debug!(email, ?outcome, "seller reconciled"),
                Err(err) => {
                    metrics::counter!("seller_worker_reconcile_failures").increment(1);
                    warn!(email, error = %err, "failed to reconcile seller, dropping");
                }
            }
            channel.ack(item.delivery_tag, false).await?;
        }
        self.settled(&distinct_emails(&batch));
        Ok(())
    }

    /// Inserts the seller if its email is free, otherwise applies the event
    /// to the stored seller. Unchanged sellers are not written.
    pub async fn reconcile(&self, event: &SellerCreatedEvent) -> Result<Reconciled, StoreError> {
        match self.store.find_by_email(event.key()).await? {
            None => match Seller::import(event) {
                Ok(seller) => {
                    self.store.insert(&seller).await?;
                    metrics::counter!("seller_worker_sellers_inserted").increment(1);
                    Ok(Reconciled::Inserted)
                }
                Err(err) => Ok(Reconciled::Invalid(err)),
            },
            Some(mut seller) => match seller.apply_update(event) {
                Ok(true) => {
                    self.store.update(&seller).await?;
                    metrics::counter!("seller_worker_sellers_updated").increment(1);
                    Ok(Reconciled::Updated)
                }
                Ok(false) => Ok(Reconciled::Unchanged),
                Err(err) => Ok(Reconciled::Invalid(err)),
            },
        }
    }

    async fn handle_failure(
        &self,
        batch: Vec<BatchItem<SellerCreatedEvent>>,
        channel: &dyn BrokerChannel,
        err: StoreError,
    ) -> Result<(), AmqpError> {
        if err.is_transient() {
            warn!(size = batch.len(), error = %err, "store unavailable, requeueing batch");
            metrics::counter!("seller_worker_batches_requeued").increment(1);
            return requeue(&batch, channel).await;
        }

        if self.record_failure(&distinct_emails(&batch)) {
            error!(
                size = batch.len(),
                error = %err,
                max_attempts = self.max_batch_attempts,
                "batch keeps failing, isolating its messages"
            );
            metrics::counter!("seller_worker_batches_isolated").increment(1);
            return self.isolate(batch, channel).await;
        }

        error!(size = batch.len(), error = %err, "failed to persist batch, requeueing");
        metrics::counter!("seller_worker_batches_requeued").increment(1);
        requeue(&batch, channel).await
    }

    /// Settles every message on its own: acked when it could be persisted,
    /// dead-lettered when it still fails. Messages the store could not be
    /// reached for go back to the queue.
    async fn isolate(
        &self,
        batch: Vec<BatchItem<SellerCreatedEvent>>,
        channel: &dyn BrokerChannel,
    ) -> Result<(), AmqpError> {
        let mut settled = Vec::with_capacity(batch.len());
        for item in &batch {
            let email = item.message.key();
            match self.reconcile(&item.message).await {
                Ok(outcome) => {
                    debug!(email, ?outcome, "isolated seller persisted");
                    channel.ack(item.delivery_tag, false).await?;
                    settled.push(email.to_owned());
                }
                Err(err) if err.is_transient() => {
                    warn!(email, error = %err, "store unavailable, requeueing isolated seller");
                    channel.nack(item.delivery_tag, false, true).await?;
                }
                Err(err) => {
                    metrics::counter!("seller_worker_dead_lettered").increment(1);
                    error!(email, error = %err, "seller cannot be persisted, dead-lettering");
                    channel.reject(item.delivery_tag, false).await?;
                    settled.push(email.to_owned());
                }
            }
        }
        self.settled(&settled);
        Ok(())
    }

    /// Counts one more failure for each email, forgetting expired ones.
    /// True once any of them reached the limit.
    fn record_failure(&self, emails: &[String]) -> bool {
        let now = Instant::now();
        let mut failures = self.failures();
        failures.retain(|_, failure| now.duration_since(failure.last_failed) < self.failure_ttl);

        let mut exhausted = false;
        for email in emails {
            let failure = failures.entry(email.clone()).or_insert(FailureCount {
                attempts: 0,
                last_failed: now,
            });
            failure.attempts += 1;
            failure.last_failed = now;
            exhausted |= failure.attempts >= self.max_batch_attempts;
        }
        metrics::gauge!("seller_worker_tracked_failures").set(failures.len() as f64);
        exhausted
    }

    fn settled(&self, emails: &[String]) {
        let mut failures = self.failures();
        if failures.is_empty() {
            return;
        }
        for email in emails {
            failures.remove(email);
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, FailureCount>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<S: SellerStore> BatchProcessor<SellerCreatedEvent> for SellerBatchProcessor<S> {
    async fn process_batch(
        &self,
        batch: Vec<BatchItem<SellerCreatedEvent>>,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<(), AmqpError> {
        self.handle(batch, &*channel).await
    }
}

async fn requeue(
    batch: &[BatchItem<SellerCreatedEvent>],
    channel: &dyn BrokerChannel,
) -> Result<(), AmqpError> {
    for item in batch {
        channel.nack(item.delivery_tag, false, true).await?;
    }
    Ok(())
}

fn distinct_emails(batch: &[BatchItem<SellerCreatedEvent>]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(batch.len());
    batch
        .iter()
        .map(|item| item.message.key())
        .filter(|email| seen.insert(*email))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use common_amqp::broker::{DeliveryStream, PendingConfirm};
    use common_amqp::DeadLetter;
    use uuid::Uuid;

    use super::*;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settled {
        Ack { tag: u64, multiple: bool },
        Nack { tag: u64, requeue: bool },
        Reject { tag: u64, requeue: bool },
    }

    // Only records settlements, the processor never touches the rest
    #[derive(Default)]
    struct RecordingChannel {
        settled: Mutex<Vec<Settled>>,
    }

    impl RecordingChannel {
        fn settled(&self) -> Vec<Settled> {
            self.settled.lock().unwrap().clone()
        }

        fn record(&self, settled: Settled) -> Result<(), AmqpError> {
            self.settled.lock().unwrap().push(settled);
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerChannel for RecordingChannel {
        fn id(&self) -> u64 {
            1
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn declare_exchange(&self, _name: &str) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn declare_queue(
            &self,
            _name: &str,
            _dead_letter: Option<&DeadLetter>,
        ) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn bind_queue(&self, _queue: &str, _exchange: &str, _key: &str) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn set_prefetch(&self, _count: u16) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn enable_confirms(&self) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn publish(
            &self,
            _exchange: &str,
            _routing_key: &str,
            _payload: &[u8],
        ) -> Result<PendingConfirm, AmqpError> {
            Err(AmqpError::ChannelClosed)
        }

        async fn consume(&self, _queue: &str, _tag: &str) -> Result<DeliveryStream, AmqpError> {
            Err(AmqpError::ChannelClosed)
        }

        async fn ack(&self, tag: u64, multiple: bool) -> Result<(), AmqpError> {
            self.record(Settled::Ack { tag, multiple })
        }

        async fn nack(&self, tag: u64, _multiple: bool, requeue: bool) -> Result<(), AmqpError> {
            self.record(Settled::Nack { tag, requeue })
        }

        async fn reject(&self, tag: u64, requeue: bool) -> Result<(), AmqpError> {
            self.record(Settled::Reject { tag, requeue })
        }

        async fn close(&self) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    fn event(n: u64) -> SellerCreatedEvent {
        SellerCreatedEvent {
            id: Uuid::now_v7(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: format!("seller-{n}@example.com"),
            phone_number: "555-0100".to_string(),
            region: "EU".to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn batch(events: Vec<SellerCreatedEvent>) -> Vec<BatchItem<SellerCreatedEvent>> {
        events
            .into_iter()
            .zip(1..)
            .map(|(message, delivery_tag)| BatchItem {
                message,
                delivery_tag,
            })
            .collect()
    }

    fn processor(store: MemoryStore) -> SellerBatchProcessor<MemoryStore> {
        let retry = RetryPolicy::build(2, Duration::from_millis(1))
            .max_attempts(3)
            .provide();
        SellerBatchProcessor::new(store, retry, 3)
    }

    fn acks(tags: std::ops::RangeInclusive<u64>) -> Vec<Settled> {
        tags.map(|tag| Settled::Ack {
            tag,
            multiple: false,
        })
        .collect()
    }

    #[tokio::test]
    async fn test_inserts_new_sellers_and_acks_each() {
        let processor = processor(MemoryStore::new());
        let channel = RecordingChannel::default();

        processor
            .handle(batch((1..=3).map(event).collect()), &channel)
            .await
            .unwrap();

        assert_eq!(processor.store().len(), 3);
        assert_eq!(processor.store().bulk_insert_calls(), 1);
        assert_eq!(channel.settled(), acks(1..=3));
    }

    #[tokio::test]
    async fn test_all_duplicates_ack_cumulatively() {
        let stored: Vec<Seller> = (1..=3)
            .map(|n| Seller::import(&event(n)).unwrap())
            .collect();
        let processor = processor(MemoryStore::with_sellers(stored));
        let channel = RecordingChannel::default();

        processor
            .handle(batch((1..=3).map(event).collect()), &channel)
            .await
            .unwrap();

        assert_eq!(processor.store().bulk_insert_calls(), 0);
        assert_eq!(
            channel.settled(),
            vec![Settled::Ack {
                tag: 3,
                multiple: true
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_events_are_acked_without_persisting() {
        let processor = processor(MemoryStore::new());
        let channel = RecordingChannel::default();
        let mut invalid = event(2);
        invalid.region = String::new();

        processor
            .handle(batch(vec![event(1), invalid, event(3)]), &channel)
            .await
            .unwrap();

        assert_eq!(processor.store().len(), 2);
        assert!(processor.store().get("seller-2@example.com").is_none());
        assert_eq!(channel.settled(), acks(1..=3));
    }

    #[tokio::test]
    async fn test_conflict_falls_back_to_reconciling_each() {
        let store = MemoryStore::new();
        let mut concurrent = Seller::import(&event(3)).unwrap();
        concurrent.region = "NA".to_string();
        store.insert_before_next_bulk(concurrent);
        let processor = processor(store);
        let channel = RecordingChannel::default();

        processor
            .handle(batch((1..=5).map(event).collect()), &channel)
            .await
            .unwrap();

        let store = processor.store();
        assert_eq!(store.len(), 5);
        assert_eq!(store.insert_calls(), 4);
        assert_eq!(store.update_calls(), 1);
        assert_eq!(store.get("seller-3@example.com").unwrap().region, "EU");
        assert_eq!(channel.settled(), acks(1..=5));
    }

    #[tokio::test]
    async fn test_reconcile_skips_unchanged_sellers() {
        let event = event(1);
        let processor = processor(MemoryStore::with_sellers([Seller::import(&event).unwrap()]));

        let outcome = processor.reconcile(&event).await.unwrap();

        assert_eq!(outcome, Reconciled::Unchanged);
        assert_eq!(processor.store().update_calls(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_identity_of_stored_seller() {
        let original = event(1);
        let stored = Seller::import(&original).unwrap();
        let processor = processor(MemoryStore::with_sellers([stored.clone()]));

        let mut changed = event(1);
        changed.is_active = false;
        let outcome = processor.reconcile(&changed).await.unwrap();

        assert_eq!(outcome, Reconciled::Updated);
        let updated = processor.store().get(&original.email).unwrap();
        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.created_at, stored.created_at);
        assert!(!updated.is_active);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemoryStore::new();
        store.fail_next_bulk_inserts(2);
        let processor = processor(store);
        let channel = RecordingChannel::default();

        processor
            .handle(batch((1..=2).map(event).collect()), &channel)
            .await
            .unwrap();

        assert_eq!(processor.store().bulk_insert_calls(), 3);
        assert_eq!(processor.store().len(), 2);
        assert_eq!(channel.settled(), acks(1..=2));
    }

    #[tokio::test]
    async fn test_exhausted_transient_retries_requeue() {
        let store = MemoryStore::new();
        store.fail_next_bulk_inserts(3);
        let processor = processor(store);
        let channel = RecordingChannel::default();

        processor
            .handle(batch((1..=2).map(event).collect()), &channel)
            .await
            .unwrap();

        assert_eq!(processor.store().bulk_insert_calls(), 3);
        assert!(processor.store().is_empty());
        assert_eq!(
            channel.settled(),
            vec![
                Settled::Nack {
                    tag: 1,
                    requeue: true
                },
                Settled::Nack {
                    tag: 2,
                    requeue: true
                },
            ]
        );
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 0);
    }

    #[tokio::test]
    async fn test_store_outage_never_dead_letters() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let processor = processor(store);

        for _ in 0..6 {
            let channel = RecordingChannel::default();
            processor
                .handle(batch((1..=2).map(event).collect()), &channel)
                .await
                .unwrap();
            assert_eq!(
                channel.settled(),
                vec![
                    Settled::Nack {
                        tag: 1,
                        requeue: true
                    },
                    Settled::Nack {
                        tag: 2,
                        requeue: true
                    },
                ]
            );
        }
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 0);

        processor.store().set_offline(false);
        let channel = RecordingChannel::default();
        processor
            .handle(batch((1..=2).map(event).collect()), &channel)
            .await
            .unwrap();
        assert_eq!(processor.store().len(), 2);
        assert_eq!(channel.settled(), acks(1..=2));
    }

    #[tokio::test]
    async fn test_isolation_requeues_sellers_the_store_cannot_reach() {
        let store = MemoryStore::new();
        store.break_next_bulk_inserts(3);
        store.make_email_unavailable("seller-2@example.com");
        let processor = processor(store);

        for _ in 0..2 {
            processor
                .handle(batch((1..=3).map(event).collect()), &RecordingChannel::default())
                .await
                .unwrap();
        }

        let channel = RecordingChannel::default();
        processor
            .handle(batch((1..=3).map(event).collect()), &channel)
            .await
            .unwrap();

        assert_eq!(
            channel.settled(),
            vec![
                Settled::Ack {
                    tag: 1,
                    multiple: false
                },
                Settled::Nack {
                    tag: 2,
                    requeue: true
                },
                Settled::Ack {
                    tag: 3,
                    multiple: false
                },
            ]
        );
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 0);
        assert_eq!(processor.failed_attempts("seller-2@example.com"), 3);
    }

    #[tokio::test]
    async fn test_failures_expire() {
        let store = MemoryStore::new();
        store.break_next_bulk_inserts(2);
        let processor = processor(store).with_failure_ttl(Duration::from_millis(50));
        let events: Vec<_> = (1..=2).map(event).collect();

        processor
            .handle(batch(events.clone()), &RecordingChannel::default())
            .await
            .unwrap();
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 0);

        processor
            .handle(batch(events), &RecordingChannel::default())
            .await
            .unwrap();
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 1);
        assert_eq!(processor.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_isolate_the_batch() {
        let store = MemoryStore::new();
        store.break_email("seller-2@example.com");
        let processor = processor(store);

        for attempt in 1..=2 {
            let channel = RecordingChannel::default();
            processor
                .handle(batch((1..=3).map(event).collect()), &channel)
                .await
                .unwrap();
            assert!(channel
                .settled()
                .iter()
                .all(|settled| matches!(settled, Settled::Nack { requeue: true, .. })));
            assert_eq!(processor.failed_attempts("seller-2@example.com"), attempt);
        }

        let channel = RecordingChannel::default();
        processor
            .handle(batch((1..=3).map(event).collect()), &channel)
            .await
            .unwrap();

        assert_eq!(
            channel.settled(),
            vec![
                Settled::Ack {
                    tag: 1,
                    multiple: false
                },
                Settled::Reject {
                    tag: 2,
                    requeue: false
                },
                Settled::Ack {
                    tag: 3,
                    multiple: false
                },
            ]
        );
        assert_eq!(processor.store().len(), 2);
        assert_eq!(processor.failed_attempts("seller-2@example.com"), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let store = MemoryStore::new();
        store.break_next_bulk_inserts(1);
        let processor = processor(store);

        let channel = RecordingChannel::default();
        let events: Vec<_> = (1..=2).map(event).collect();
        processor.handle(batch(events.clone()), &channel).await.unwrap();
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 1);

        processor.handle(batch(events), &channel).await.unwrap();
        assert_eq!(processor.failed_attempts("seller-1@example.com"), 0);
        assert_eq!(processor.store().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let processor = processor(MemoryStore::new());
        let channel = RecordingChannel::default();

        processor.handle(Vec::new(), &channel).await.unwrap();

        assert!(channel.settled().is_empty());
    }
}
