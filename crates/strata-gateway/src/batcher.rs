use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strata_core::config::GatewayConfig;
use strata_core::traits::ProgressSink;
use strata_core::types::{ProgressEnvelope, SessionId};

use crate::connection::ConnectionRegistry;
use crate::protocol::BatchFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    /// Flushes the session's batch right away.
    High,
}

struct MessageBatch {
    messages: Vec<serde_json::Value>,
    created: Instant,
}

/// Coalesces outbound messages per session before they reach the
/// [`ConnectionRegistry`].
///
/// A batch goes out when it reaches `max_batch` messages, when a
/// high-priority message joins it, or when the sweeper finds it older
/// than `max_age`. Batches from different triggers may arrive out of
/// order; clients key on step numbers.
pub struct MessageBatcher {
    registry: Arc<ConnectionRegistry>,
    batches: Mutex<HashMap<SessionId, MessageBatch>>,
    max_batch: usize,
    max_age: Duration,
    flushes: AtomicU64,
    messages_sent: AtomicU64,
}

impl MessageBatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, max_batch: usize, max_age: Duration) -> Self {
        Self {
            registry,
            batches: Mutex::new(HashMap::new()),
            max_batch: max_batch.max(1),
            max_age,
            flushes: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn from_config(registry: Arc<ConnectionRegistry>, config: &GatewayConfig) -> Self {
        Self::new(
            registry,
            config.batch_size,
            Duration::from_millis(config.batch_max_age_ms),
        )
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, MessageBatch>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a message to its session's batch. Returns the number of
    /// messages flushed as a result (zero if the batch is still open).
    pub fn queue(&self, session: &SessionId, message: serde_json::Value, priority: Priority) -> usize {
        let ready = {
            let mut batches = self.lock();
            let batch = batches.entry(session.clone()).or_insert_with(|| MessageBatch {
                messages: Vec::new(),
                created: Instant::now(),
            });
            batch.messages.push(message);
            if priority == Priority::High || batch.messages.len() >= self.max_batch {
                batches.remove(session)
            } else {
                None
            }
        };
        match ready {
            Some(batch) => self.deliver(session, batch),
            None => 0,
        }
    }

    /// Flush one session's open batch.
    pub fn flush(&self, session: &SessionId) -> usize {
        let batch = self.lock().remove(session);
        batch.map(|b| self.deliver(session, b)).unwrap_or(0)
    }

    /// Flush every batch older than the age threshold. Returns batches flushed.
    pub fn flush_stale(&self) -> usize {
        let stale: Vec<(SessionId, MessageBatch)> = {
            let mut batches = self.lock();
            let expired: Vec<SessionId> = batches
                .iter()
                .filter(|(_, b)| b.created.elapsed() >= self.max_age)
                .map(|(s, _)| s.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|s| batches.remove(&s).map(|b| (s, b)))
                .collect()
        };
        let n = stale.len();
        for (session, batch) in stale {
            self.deliver(&session, batch);
        }
        n
    }

    /// Flush everything regardless of age. Returns batches flushed.
    pub fn flush_all(&self) -> usize {
        let all: Vec<(SessionId, MessageBatch)> = self.lock().drain().collect();
        let n = all.len();
        for (session, batch) in all {
            self.deliver(&session, batch);
        }
        n
    }

    fn deliver(&self, session: &SessionId, batch: MessageBatch) -> usize {
        let count = batch.messages.len();
        if count == 0 {
            return 0;
        }
        let frame = BatchFrame::new(session.clone(), batch.messages);
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(session_id = %session, error = %e, "Failed to encode batch");
                return 0;
            }
        };
        let connections = self.registry.broadcast(session, json);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
        debug!(
            session_id = %session,
            messages = count,
            connections,
            age_ms = batch.created.elapsed().as_millis() as u64,
            "Flushed message batch"
        );
        count
    }

    /// Messages waiting in a session's open batch.
    pub fn pending(&self, session: &SessionId) -> usize {
        self.lock().get(session).map(|b| b.messages.len()).unwrap_or(0)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Periodically flush aged batches until cancelled; drains on exit.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        batcher.flush_all();
                        debug!("Message batch sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        batcher.flush_stale();
                    }
                }
            }
        })
    }
}

impl ProgressSink for MessageBatcher {
    fn emit(&self, session: &SessionId, envelope: ProgressEnvelope) -> BoxFuture<'_, ()> {
        let session = session.clone();
        Box::pin(async move {
            let priority = if envelope.is_urgent() {
                Priority::High
            } else {
                Priority::Normal
            };
            match serde_json::to_value(&envelope) {
                Ok(value) => {
                    self.queue(&session, value, priority);
                }
                Err(e) => warn!(session_id = %session, error = %e, "Failed to encode progress envelope"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strata_core::types::{ExecutionId, ExecutionStatus, ProgressSubtype};

    use super::*;

    fn setup(max_batch: usize, max_age_ms: u64) -> (Arc<ConnectionRegistry>, MessageBatcher) {
        let registry = Arc::new(ConnectionRegistry::new(100));
        let batcher = MessageBatcher::new(
            Arc::clone(&registry),
            max_batch,
            Duration::from_millis(max_age_ms),
        );
        (registry, batcher)
    }

    #[tokio::test]
    async fn test_burst_flush_count_is_ceiling_of_batches() {
        for (size, extra) in [(10usize, 3usize), (5, 0), (4, 9), (1, 2)] {
            let (_registry, batcher) = setup(size, 20);
            let session = SessionId::from_string("s1");
            for i in 0..size + extra {
                batcher.queue(&session, json!({ "i": i }), Priority::Normal);
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            batcher.flush_stale();

            let expected = (size + extra).div_ceil(size) as u64;
            assert_eq!(batcher.flush_count(), expected, "size {size} + {extra}");
            assert_eq!(batcher.messages_sent(), (size + extra) as u64);
            assert_eq!(batcher.pending(&session), 0);
        }
    }

    #[tokio::test]
    async fn test_high_priority_flushes_immediately() {
        let (registry, batcher) = setup(10, 10_000);
        let session = SessionId::from_string("s1");
        let (_conn, mut rx) = registry.connect(&session);

        batcher.queue(&session, json!("a"), Priority::Normal);
        batcher.queue(&session, json!("b"), Priority::Normal);
        assert_eq!(batcher.flush_count(), 0);

        assert_eq!(batcher.queue(&session, json!("urgent"), Priority::High), 3);
        assert_eq!(batcher.flush_count(), 1);

        let frame: BatchFrame = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.count, 3);
        assert_eq!(frame.messages, vec![json!("a"), json!("b"), json!("urgent")]);
    }

    #[tokio::test]
    async fn test_single_high_priority_message() {
        let (_registry, batcher) = setup(10, 10_000);
        let session = SessionId::from_string("s1");
        assert_eq!(batcher.queue(&session, json!("x"), Priority::High), 1);
        assert_eq!(batcher.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_young_batches_survive_sweep() {
        let (_registry, batcher) = setup(10, 10_000);
        let session = SessionId::from_string("s1");
        batcher.queue(&session, json!(1), Priority::Normal);
        assert_eq!(batcher.flush_stale(), 0);
        assert_eq!(batcher.pending(&session), 1);
        assert_eq!(batcher.flush_all(), 1);
        assert_eq!(batcher.pending(&session), 0);
    }

    #[tokio::test]
    async fn test_sessions_batch_independently() {
        let (_registry, batcher) = setup(2, 10_000);
        let a = SessionId::from_string("a");
        let b = SessionId::from_string("b");
        batcher.queue(&a, json!(1), Priority::Normal);
        batcher.queue(&b, json!(1), Priority::Normal);
        assert_eq!(batcher.flush_count(), 0);
        batcher.queue(&a, json!(2), Priority::Normal);
        assert_eq!(batcher.flush_count(), 1);
        assert_eq!(batcher.pending(&b), 1);
    }

    #[tokio::test]
    async fn test_sweeper_flushes_aged_batches() {
        let (registry, batcher) = setup(10, 20);
        let batcher = Arc::new(batcher);
        let session = SessionId::from_string("s1");
        let (_conn, mut rx) = registry.connect(&session);
        let cancel = CancellationToken::new();
        let handle = batcher.spawn_sweeper(Duration::from_millis(10), cancel.clone());

        batcher.queue(&session, json!("slow"), Priority::Normal);
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("slow"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_urgent_envelopes_bypass_batching() {
        let (registry, batcher) = setup(10, 10_000);
        let session = SessionId::from_string("s1");
        let (_conn, mut rx) = registry.connect(&session);
        let id = ExecutionId::new();

        let progress = ProgressEnvelope::new("node", ProgressSubtype::Start, id.clone(), 1, ExecutionStatus::Running);
        batcher.emit(&session, progress).await;
        assert_eq!(batcher.pending(&session), 1);

        let end = ProgressEnvelope::new("execution", ProgressSubtype::End, id, 2, ExecutionStatus::Completed);
        batcher.emit(&session, end).await;
        assert_eq!(batcher.pending(&session), 0);

        let frame: BatchFrame = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.count, 2);
        assert_eq!(frame.messages[1]["subtype"], "end");
        assert_eq!(frame.messages[1]["stepNumber"], 2);
    }
}
