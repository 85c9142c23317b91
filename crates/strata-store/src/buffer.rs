use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strata_core::error::Result;
use strata_core::traits::CheckpointStore;
use strata_core::types::{Checkpoint, ExecutionId};

struct Pending {
    queued_at: Instant,
    checkpoint: Checkpoint,
}

struct BufferInner {
    pending: VecDeque<Pending>,
    max_batch: usize,
}

impl BufferInner {
    fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.pending
            .iter()
            .map(|p| now.saturating_duration_since(p.queued_at))
            .max()
    }
}

/// Batches checkpoint writes against a durable store.
///
/// Flushes when the batch is full, when the oldest entry is older than
/// `max_age`, or immediately for critical checkpoint kinds. A failed flush
/// puts the batch back at the front of the queue; nothing is dropped.
pub struct CheckpointBuffer {
    store: Arc<dyn CheckpointStore>,
    inner: Mutex<BufferInner>,
    /// Configured batch size; the current one may be raised while degraded.
    base_batch: usize,
    max_age: Duration,
    written: AtomicU64,
}

impl CheckpointBuffer {
    pub fn new(store: Arc<dyn CheckpointStore>, max_batch: usize, max_age: Duration) -> Self {
        Self {
            store,
            inner: Mutex::new(BufferInner {
                pending: VecDeque::new(),
                max_batch: max_batch.max(1),
            }),
            base_batch: max_batch.max(1),
            max_age,
            written: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Queue a checkpoint, flushing if any flush condition holds.
    ///
    /// Returns the number of checkpoints written by this call. A failed
    /// flush is logged and re-queued, and reported as zero written.
    pub async fn add(&self, checkpoint: Checkpoint, force_flush: bool) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let critical = checkpoint.kind.is_critical();
        inner.pending.push_back(Pending {
            queued_at: Instant::now(),
            checkpoint,
        });

        let full = inner.pending.len() >= inner.max_batch;
        let stale = inner
            .oldest_age(Instant::now())
            .is_some_and(|age| age >= self.max_age);
        if !(force_flush || critical || full || stale) {
            return Ok(0);
        }

        match self.flush_locked(&mut inner, None).await {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!(error = %e, pending = inner.pending.len(), "Checkpoint flush failed, batch re-queued");
                Ok(0)
            }
        }
    }

    /// Write everything buffered.
    pub async fn flush(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        self.flush_locked(&mut inner, None).await
    }

    /// Write everything buffered for one execution, leaving the rest queued.
    pub async fn flush_for(&self, execution: &ExecutionId) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        self.flush_locked(&mut inner, Some(execution)).await
    }

    /// Final flush on process shutdown.
    pub async fn shutdown_flush(&self) -> Result<usize> {
        let n = self.flush().await?;
        info!(flushed = n, "Checkpoint buffer drained");
        Ok(n)
    }

    /// Flush only if the oldest entry has exceeded the age threshold.
    pub async fn flush_if_stale(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let stale = inner
            .oldest_age(Instant::now())
            .is_some_and(|age| age >= self.max_age);
        if !stale {
            return Ok(0);
        }
        self.flush_locked(&mut inner, None).await
    }

    pub async fn set_max_batch(&self, max_batch: usize) {
        let mut inner = self.inner.lock().await;
        let max_batch = max_batch.max(1);
        if inner.max_batch != max_batch {
            debug!(from = inner.max_batch, to = max_batch, "Checkpoint batch size changed");
            inner.max_batch = max_batch;
        }
    }

    pub fn base_batch(&self) -> usize {
        self.base_batch
    }

    pub async fn max_batch(&self) -> usize {
        self.inner.lock().await.max_batch
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn pending_for(&self, execution: &ExecutionId) -> usize {
        self.inner
            .lock()
            .await
            .pending
            .iter()
            .filter(|p| &p.checkpoint.execution_id == execution)
            .count()
    }

    /// Checkpoints successfully written since creation.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Age-based flushing in the background until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = buffer.flush_if_stale().await {
                            warn!(error = %e, "Checkpoint sweep flush failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("Checkpoint sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn flush_locked(
        &self,
        inner: &mut BufferInner,
        only: Option<&ExecutionId>,
    ) -> Result<usize> {
        let (batch, rest): (VecDeque<Pending>, VecDeque<Pending>) = match only {
            None => (std::mem::take(&mut inner.pending), VecDeque::new()),
            Some(id) => std::mem::take(&mut inner.pending)
                .into_iter()
                .partition(|p| &p.checkpoint.execution_id == id),
        };
        inner.pending = rest;

        if batch.is_empty() {
            return Ok(0);
        }

        let checkpoints: Vec<Checkpoint> = batch.iter().map(|p| p.checkpoint.clone()).collect();
        match self.store.append(&checkpoints).await {
            Ok(n) => {
                self.written.fetch_add(n as u64, Ordering::Relaxed);
                debug!(flushed = n, remaining = inner.pending.len(), "Checkpoints flushed");
                Ok(n)
            }
            Err(e) => {
                for p in batch.into_iter().rev() {
                    inner.pending.push_front(p);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use chrono::Utc;
    use futures::future::BoxFuture;

    use strata_core::error::StrataError;
    use strata_core::types::{CheckpointKind, Execution, SessionId};

    use super::*;
    use crate::checkpoint::SqliteCheckpointStore;

    /// Store that fails every write while `down` is set.
    struct FlakyStore {
        inner: SqliteCheckpointStore,
        down: AtomicBool,
        appends: AtomicU64,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: SqliteCheckpointStore::in_memory().unwrap(),
                down: AtomicBool::new(false),
                appends: AtomicU64::new(0),
            }
        }
    }

    impl CheckpointStore for FlakyStore {
        fn append(&self, checkpoints: &[Checkpoint]) -> BoxFuture<'_, Result<usize>> {
            if self.down.load(Ordering::SeqCst) {
                return Box::pin(async { Err(StrataError::CheckpointStore("down".into())) });
            }
            self.appends.fetch_add(1, Ordering::SeqCst);
            self.inner.append(checkpoints)
        }

        fn history(
            &self,
            execution: &ExecutionId,
            limit: Option<usize>,
        ) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
            self.inner.history(execution, limit)
        }

        fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
            self.inner.save_execution(execution)
        }

        fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
            self.inner.load_execution(id)
        }

        fn list_executions(
            &self,
            session: &SessionId,
            limit: usize,
        ) -> BoxFuture<'_, Result<Vec<Execution>>> {
            self.inner.list_executions(session, limit)
        }
    }

    fn cp(id: &ExecutionId, step: u64, kind: CheckpointKind) -> Checkpoint {
        Checkpoint {
            execution_id: id.clone(),
            step,
            kind,
            node_id: None,
            state: serde_json::json!({}),
            created_at: Utc::now(),
            elapsed_ms: None,
        }
    }

    #[tokio::test]
    async fn test_flushes_when_batch_full() {
        let store = Arc::new(FlakyStore::new());
        let buffer = CheckpointBuffer::new(store.clone(), 3, Duration::from_secs(60));
        let id = ExecutionId::new();

        assert_eq!(buffer.add(cp(&id, 1, CheckpointKind::NodeStart), false).await.unwrap(), 0);
        assert_eq!(buffer.add(cp(&id, 2, CheckpointKind::NodeEnd), false).await.unwrap(), 0);
        assert_eq!(buffer.add(cp(&id, 3, CheckpointKind::NodeStart), false).await.unwrap(), 3);
        assert_eq!(buffer.pending().await, 0);
        assert_eq!(store.appends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_kinds_flush_immediately() {
        let store = Arc::new(FlakyStore::new());
        let buffer = CheckpointBuffer::new(store.clone(), 10, Duration::from_secs(60));
        let id = ExecutionId::new();

        buffer.add(cp(&id, 1, CheckpointKind::NodeStart), false).await.unwrap();
        let written = buffer
            .add(cp(&id, 2, CheckpointKind::Error), false)
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(buffer.pending().await, 0);
    }

    #[tokio::test]
    async fn test_force_flush() {
        let store = Arc::new(FlakyStore::new());
        let buffer = CheckpointBuffer::new(store, 10, Duration::from_secs(60));
        let id = ExecutionId::new();
        assert_eq!(buffer.add(cp(&id, 1, CheckpointKind::NodeEnd), true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues() {
        let store = Arc::new(FlakyStore::new());
        let buffer = CheckpointBuffer::new(store.clone(), 2, Duration::from_secs(60));
        let id = ExecutionId::new();

        store.down.store(true, Ordering::SeqCst);
        buffer.add(cp(&id, 1, CheckpointKind::NodeStart), false).await.unwrap();
        assert_eq!(buffer.add(cp(&id, 2, CheckpointKind::NodeEnd), false).await.unwrap(), 0);
        assert_eq!(buffer.pending().await, 2);
        assert!(buffer.flush().await.is_err());
        assert_eq!(buffer.pending().await, 2);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(buffer.flush().await.unwrap(), 2);
        let steps: Vec<u64> = store
            .history(&id, None)
            .await
            .unwrap()
            .iter()
            .map(|c| c.step)
            .collect();
        assert_eq!(steps, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_flush_for_leaves_other_executions() {
        let store = Arc::new(FlakyStore::new());
        let buffer = CheckpointBuffer::new(store.clone(), 10, Duration::from_secs(60));
        let a = ExecutionId::new();
        let b = ExecutionId::new();

        buffer.add(cp(&a, 1, CheckpointKind::NodeStart), false).await.unwrap();
        buffer.add(cp(&b, 1, CheckpointKind::NodeStart), false).await.unwrap();
        buffer.add(cp(&a, 2, CheckpointKind::NodeEnd), false).await.unwrap();

        assert_eq!(buffer.flush_for(&a).await.unwrap(), 2);
        assert_eq!(buffer.pending_for(&a).await, 0);
        assert_eq!(buffer.pending_for(&b).await, 1);
    }

    #[tokio::test]
    async fn test_written_count_is_batch_size_invariant() {
        for batch in [1, 3, 7, 50] {
            let store = Arc::new(FlakyStore::new());
            let buffer = CheckpointBuffer::new(store.clone(), batch, Duration::from_secs(60));
            let id = ExecutionId::new();

            buffer.add(cp(&id, 0, CheckpointKind::ExecutionStart), false).await.unwrap();
            for step in 1..=20 {
                buffer.add(cp(&id, step, CheckpointKind::NodeEnd), false).await.unwrap();
            }
            buffer.add(cp(&id, 21, CheckpointKind::ExecutionEnd), false).await.unwrap();
            buffer.flush_for(&id).await.unwrap();

            let history = store.history(&id, None).await.unwrap();
            assert_eq!(history.len(), 22, "batch size {batch}");
            assert!(history.windows(2).all(|w| w[0].step <= w[1].step));
            assert_eq!(buffer.written(), 22);
        }
    }

    #[tokio::test]
    async fn test_sweeper_flushes_stale_batch() {
        let store = Arc::new(FlakyStore::new());
        let buffer = Arc::new(CheckpointBuffer::new(
            store.clone(),
            100,
            Duration::from_millis(30),
        ));
        let cancel = CancellationToken::new();
        let handle = buffer.spawn_sweeper(Duration::from_millis(10), cancel.clone());

        let id = ExecutionId::new();
        buffer.add(cp(&id, 1, CheckpointKind::NodeStart), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(buffer.pending().await, 0);
        assert_eq!(store.history(&id, None).await.unwrap().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_set_max_batch_clamps_to_one() {
        let buffer = CheckpointBuffer::new(Arc::new(FlakyStore::new()), 10, Duration::from_secs(1));
        buffer.set_max_batch(0).await;
        assert_eq!(buffer.max_batch().await, 1);
    }
}
