//! Offline delivery queue
//!
//! Every outgoing message is recorded before the first delivery attempt.
//! A record stays `Pending` until it is delivered, canceled, or has failed
//! `max_attempts` times; terminal records are kept for history.
//!
//! Updates go through [`QueueStore::update_pending`], which only writes
//! while the stored record is still `Pending`. A cancel that lands while
//! an attempt is in flight therefore wins over the attempt's outcome.
//!
//! At most one attempt per record runs at a time: the fast path and the
//! scheduler both claim the id first, and a tick skips records that are
//! already being attempted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Canceled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != DeliveryStatus::Pending
    }
}

impl FromStr for DeliveryStatus {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "canceled" => Ok(DeliveryStatus::Canceled),
            other => Err(NodeError::CorruptRecord(format!("unknown status '{}'", other))),
        }
    }
}

/// One outgoing message and its delivery history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub recipient: String,
    /// Plaintext body; sealed per attempt
    pub content: Vec<u8>,
    pub reply_to: Option<Uuid>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueuedMessage {
    pub fn new(
        recipient: &str,
        content: Vec<u8>,
        reply_to: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        QueuedMessage {
            id: Uuid::new_v4(),
            recipient: recipient.to_string(),
            content,
            reply_to,
            status: DeliveryStatus::Pending,
            created_at: now,
            retry_count: 0,
            next_retry_at: now,
            delivered_at: None,
            last_error: None,
        }
    }
}

/// Durable home of queue records
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, message: &QueuedMessage) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>>;

    /// Overwrite the record only if it is still `Pending`.
    /// Returns false when it had already reached a terminal state.
    async fn update_pending(&self, message: &QueuedMessage) -> Result<bool>;

    /// `Pending` records with `next_retry_at <= now`, oldest first
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>>;

    /// All records, optionally filtered by status, oldest first
    async fn list(&self, status: Option<DeliveryStatus>) -> Result<Vec<QueuedMessage>>;
}

/// In-process queue store
#[derive(Default)]
pub struct MemoryQueueStore {
    records: RwLock<Vec<QueuedMessage>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, message: &QueuedMessage) -> Result<()> {
        self.records.write().await.push(message.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        Ok(self.records.read().await.iter().find(|m| m.id == id).cloned())
    }

    async fn update_pending(&self, message: &QueuedMessage) -> Result<bool> {
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|m| m.id == message.id && m.status == DeliveryStatus::Pending)
        {
            Some(record) => {
                *record = message.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|m| m.status == DeliveryStatus::Pending && m.next_retry_at <= now)
            .cloned()
            .collect())
    }

    async fn list(&self, status: Option<DeliveryStatus>) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect())
    }
}

/// What the queue needs from the messaging layer
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Check the recipient is reachable right now
    async fn probe(&self, recipient: &str) -> Result<()>;

    /// Seal and send the message
    async fn deliver(&self, message: &QueuedMessage) -> Result<()>;
}

/// Outcome counts of one scheduler tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub delivered: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// Retry scheduler over a [`QueueStore`]
pub struct DeliveryQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    /// Ids with an attempt currently running
    in_flight: Mutex<HashSet<Uuid>>,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Record a message without attempting it
    pub async fn enqueue(
        &self,
        recipient: &str,
        content: Vec<u8>,
        reply_to: Option<Uuid>,
    ) -> Result<QueuedMessage> {
        let message = QueuedMessage::new(recipient, content, reply_to, Utc::now());
        self.store.insert(&message).await?;
        debug!("Queued message {} for {}", message.id, message.recipient);
        Ok(message)
    }

    /// Record a message and try to deliver it right away.
    /// Returns the record as it stands after that first attempt.
    pub async fn queue_message(
        &self,
        transport: &dyn DeliveryTransport,
        recipient: &str,
        content: Vec<u8>,
        reply_to: Option<Uuid>,
    ) -> Result<QueuedMessage> {
        let message = self.enqueue(recipient, content, reply_to).await?;
        self.attempt_at(transport, message.id, Utc::now()).await?;
        self.store
            .get(message.id)
            .await?
            .ok_or(NodeError::NotFound(message.id))
    }

    /// One delivery attempt. A record that is no longer `Pending` is left
    /// untouched; its current status is returned. If another attempt on the
    /// same record is still running, this one is skipped.
    pub async fn attempt_at(
        &self,
        transport: &dyn DeliveryTransport,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        match self.try_attempt(transport, id, now).await? {
            Some(status) => Ok(status),
            None => {
                let current = self.store.get(id).await?.ok_or(NodeError::NotFound(id))?;
                Ok(current.status)
            }
        }
    }

    /// `None` when the record is already claimed by another attempt
    async fn try_attempt(
        &self,
        transport: &dyn DeliveryTransport,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryStatus>> {
        if !self.in_flight.lock().await.insert(id) {
            debug!("Message {} already has an attempt in flight", id);
            return Ok(None);
        }
        let result = self.attempt_claimed(transport, id, now).await;
        self.in_flight.lock().await.remove(&id);
        result.map(Some)
    }

    async fn attempt_claimed(
        &self,
        transport: &dyn DeliveryTransport,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        let mut message = self.store.get(id).await?.ok_or(NodeError::NotFound(id))?;
        if message.status != DeliveryStatus::Pending {
            return Ok(message.status);
        }

        let outcome = match transport.probe(&message.recipient).await {
            Ok(()) => transport.deliver(&message).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                message.status = DeliveryStatus::Delivered;
                message.delivered_at = Some(now);
                info!(
                    "Delivered {} to {} after {} retries",
                    message.id, message.recipient, message.retry_count
                );
            }
            Err(e) => self.record_failure(&mut message, e.to_string(), now),
        }

        if self.store.update_pending(&message).await? {
            Ok(message.status)
        } else {
            // Canceled while the attempt was running
            let current = self.store.get(id).await?.ok_or(NodeError::NotFound(id))?;
            debug!("Message {} changed to {:?} mid-attempt", id, current.status);
            Ok(current.status)
        }
    }

    fn record_failure(&self, message: &mut QueuedMessage, reason: String, now: DateTime<Utc>) {
        let delay = self.config.backoff(message.retry_count);
        message.retry_count += 1;
        message.next_retry_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        message.last_error = Some(reason);

        if message.retry_count >= self.config.max_attempts {
            message.status = DeliveryStatus::Failed;
            warn!(
                "Giving up on {} to {} after {} attempts: {}",
                message.id,
                message.recipient,
                message.retry_count,
                message.last_error.as_deref().unwrap_or_default()
            );
        } else {
            debug!(
                "Attempt {} for {} failed, next at {}",
                message.retry_count, message.id, message.next_retry_at
            );
        }
    }

    /// Attempt every due record
    pub async fn run_tick(&self, transport: &dyn DeliveryTransport) -> Result<TickReport> {
        self.run_tick_at(transport, Utc::now()).await
    }

    pub async fn run_tick_at(
        &self,
        transport: &dyn DeliveryTransport,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let mut report = TickReport::default();
        for message in self.store.due(now).await? {
            let status = match self.try_attempt(transport, message.id, now).await? {
                Some(status) => status,
                None => continue,
            };
            report.attempted += 1;
            match status {
                DeliveryStatus::Delivered => report.delivered += 1,
                DeliveryStatus::Failed => report.failed += 1,
                _ => {}
            }
        }
        if report.attempted > 0 {
            debug!("Queue tick: {:?}", report);
        }
        Ok(report)
    }

    /// Stop retrying a record. Returns false if it was already terminal.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        self.finish(id, DeliveryStatus::Canceled).await
    }

    /// Explicit delivery confirmation from outside the scheduler
    pub async fn mark_delivered(&self, id: Uuid) -> Result<bool> {
        self.finish(id, DeliveryStatus::Delivered).await
    }

    async fn finish(&self, id: Uuid, status: DeliveryStatus) -> Result<bool> {
        let mut message = self.store.get(id).await?.ok_or(NodeError::NotFound(id))?;
        if message.status.is_terminal() {
            return Ok(false);
        }
        message.status = status;
        if status == DeliveryStatus::Delivered {
            message.delivered_at = Some(Utc::now());
        }
        self.store.update_pending(&message).await
    }

    /// Cancel every pending record for a recipient (e.g. contact removed)
    pub async fn cancel_for_recipient(&self, recipient: &str) -> Result<usize> {
        let mut canceled = 0;
        for message in self.store.list(Some(DeliveryStatus::Pending)).await? {
            if message.recipient == recipient && self.cancel(message.id).await? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        self.store.get(id).await
    }

    pub async fn list(&self, status: Option<DeliveryStatus>) -> Result<Vec<QueuedMessage>> {
        self.store.list(status).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for message in self.store.list(None).await? {
            match message.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Canceled => stats.canceled += 1,
            }
        }
        Ok(stats)
    }

    /// Tick at the configured interval until `cancel` fires
    pub fn spawn_scheduler(
        self: Arc<Self>,
        transport: Arc<dyn DeliveryTransport>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let poll_interval = self.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_tick(transport.as_ref()).await {
                    warn!("Queue tick failed: {}", e);
                }
            }
            debug!("Queue scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe fails until `succeed_on` calls have been made (0 = never)
    struct ScriptedTransport {
        probes: AtomicUsize,
        deliveries: AtomicUsize,
        succeed_on: usize,
    }

    impl ScriptedTransport {
        fn new(succeed_on: usize) -> Self {
            Self {
                probes: AtomicUsize::new(0),
                deliveries: AtomicUsize::new(0),
                succeed_on,
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for ScriptedTransport {
        async fn probe(&self, recipient: &str) -> Result<()> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_on != 0 && n >= self.succeed_on {
                Ok(())
            } else {
                Err(NodeError::Frame(format!("{} unreachable (probe {})", recipient, n)))
            }
        }

        async fn deliver(&self, _message: &QueuedMessage) -> Result<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue() -> DeliveryQueue {
        DeliveryQueue::new(Arc::new(MemoryQueueStore::new()), QueueConfig::default())
    }

    /// Tick exactly when the record comes due; returns the tick times
    async fn tick_until_terminal(
        queue: &DeliveryQueue,
        transport: &dyn DeliveryTransport,
        id: Uuid,
        max_ticks: usize,
    ) -> usize {
        let mut ticks = 0;
        while ticks < max_ticks {
            let message = queue.get(id).await.unwrap().unwrap();
            if message.status.is_terminal() {
                break;
            }
            queue
                .run_tick_at(transport, message.next_retry_at)
                .await
                .unwrap();
            ticks += 1;
        }
        ticks
    }

    #[tokio::test]
    async fn test_unreachable_fails_after_five_attempts() {
        let queue = queue();
        let transport = ScriptedTransport::new(0);
        let message = queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();

        let mut now = message.created_at;
        let mut delays = Vec::new();
        for _ in 0..5 {
            queue.run_tick_at(&transport, now).await.unwrap();
            let record = queue.get(message.id).await.unwrap().unwrap();
            delays.push((record.next_retry_at - now).num_seconds());
            now = record.next_retry_at;
        }

        let record = queue.get(message.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.retry_count, 5);
        assert_eq!(delays, vec![30, 60, 120, 300, 600]);
        assert!(record.last_error.unwrap().contains("probe 5"));

        // Never retried again
        let report = queue
            .run_tick_at(&transport, now + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.probes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_not_due_is_skipped() {
        let queue = queue();
        let transport = ScriptedTransport::new(0);
        let message = queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();

        queue.run_tick_at(&transport, message.created_at).await.unwrap();
        let report = queue
            .run_tick_at(&transport, message.created_at + chrono::Duration::seconds(29))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_success_on_third_probe() {
        let queue = queue();
        let transport = ScriptedTransport::new(3);
        let message = queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();

        let ticks = tick_until_terminal(&queue, &transport, message.id, 10).await;
        assert_eq!(ticks, 3);

        let record = queue.get(message.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.retry_count, 2);
        assert!(record.delivered_at.is_some());
        assert_eq!(transport.deliveries.load(Ordering::SeqCst), 1);

        let report = queue
            .run_tick_at(&transport, Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fast_path_delivers() {
        let queue = queue();
        let transport = ScriptedTransport::new(1);

        let record = queue
            .queue_message(&transport, "bob.b32.i2p", b"hi".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_fast_path_failure_counts_as_attempt() {
        let queue = queue();
        let transport = ScriptedTransport::new(0);
        let reply_to = Uuid::new_v4();

        let record = queue
            .queue_message(&transport, "bob.b32.i2p", b"hi".to_vec(), Some(reply_to))
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.reply_to, Some(reply_to));
        assert!(record.last_error.is_some());
    }

    /// Probe takes a while, as a real STREAM CONNECT does
    #[derive(Default)]
    struct SlowTransport {
        deliveries: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryTransport for SlowTransport {
        async fn probe(&self, _recipient: &str) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }

        async fn deliver(&self, _message: &QueuedMessage) -> Result<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tick_skips_record_during_fast_path() {
        let queue = Arc::new(queue());
        let transport = Arc::new(SlowTransport::default());

        let fast_path = {
            let queue = queue.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                queue
                    .queue_message(transport.as_ref(), "bob.b32.i2p", b"hi".to_vec(), None)
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let report = queue.run_tick(transport.as_ref()).await.unwrap();
        assert_eq!(report, TickReport::default());

        let record = fast_path.await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(transport.deliveries.load(Ordering::SeqCst), 1);

        // The claim is released once the attempt finishes
        let report = queue
            .run_tick_at(transport.as_ref(), Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert!(queue.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ticks_attempt_once() {
        let queue = Arc::new(queue());
        let transport = Arc::new(SlowTransport::default());
        let message = queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();

        let (a, b) = tokio::join!(
            queue.run_tick_at(transport.as_ref(), message.created_at),
            queue.run_tick_at(transport.as_ref(), message.created_at)
        );
        assert_eq!(a.unwrap().attempted + b.unwrap().attempted, 1);
        assert_eq!(transport.deliveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_retries() {
        let queue = queue();
        let transport = ScriptedTransport::new(0);
        let message = queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();

        assert!(queue.cancel(message.id).await.unwrap());
        assert!(!queue.cancel(message.id).await.unwrap());

        let report = queue
            .run_tick_at(&transport, Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.probes.load(Ordering::SeqCst), 0);

        let status = queue
            .attempt_at(&transport, message.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_during_attempt_wins() {
        struct CancellingTransport {
            queue: Arc<DeliveryQueue>,
            id: std::sync::Mutex<Option<Uuid>>,
        }

        #[async_trait]
        impl DeliveryTransport for CancellingTransport {
            async fn probe(&self, _recipient: &str) -> Result<()> {
                let id = self.id.lock().unwrap().unwrap();
                self.queue.cancel(id).await?;
                Err(NodeError::Frame("offline".to_string()))
            }

            async fn deliver(&self, _message: &QueuedMessage) -> Result<()> {
                Ok(())
            }
        }

        let queue = Arc::new(queue());
        let message = queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();
        let transport = CancellingTransport {
            queue: queue.clone(),
            id: std::sync::Mutex::new(Some(message.id)),
        };

        let status = queue
            .attempt_at(&transport, message.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Canceled);

        let record = queue.get(message.id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_for_recipient_and_stats() {
        let queue = queue();
        let a = queue.enqueue("bob.b32.i2p", b"1".to_vec(), None).await.unwrap();
        queue.enqueue("bob.b32.i2p", b"2".to_vec(), None).await.unwrap();
        queue.enqueue("carol.b32.i2p", b"3".to_vec(), None).await.unwrap();
        assert!(queue.mark_delivered(a.id).await.unwrap());

        assert_eq!(queue.cancel_for_recipient("bob.b32.i2p").await.unwrap(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                delivered: 1,
                failed: 0,
                canceled: 1
            }
        );
    }

    #[tokio::test]
    async fn test_due_order_is_insertion_order() {
        let queue = queue();
        let transport = ScriptedTransport::new(0);
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                queue
                    .enqueue("bob.b32.i2p", vec![i], None)
                    .await
                    .unwrap()
                    .id,
            );
        }

        let due = queue
            .store
            .due(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(due.iter().map(|m| m.id).collect::<Vec<_>>(), ids);

        let report = queue
            .run_tick_at(&transport, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, 4);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let queue = Arc::new(DeliveryQueue::new(
            Arc::new(MemoryQueueStore::new()),
            QueueConfig {
                poll_interval_secs: 1,
                ..QueueConfig::default()
            },
        ));
        let transport = Arc::new(ScriptedTransport::new(1));
        queue.enqueue("bob.b32.i2p", b"hi".to_vec(), None).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = queue
            .clone()
            .spawn_scheduler(transport.clone(), cancel.clone());

        // First tick fires immediately
        for _ in 0..100 {
            if queue.stats().await.unwrap().delivered == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(queue.stats().await.unwrap().delivered, 1);

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
