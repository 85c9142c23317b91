use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strata_core::error::{Result, StrataError};
use strata_core::traits::{StateStore, StateValue};
use strata_core::types::ExecutionId;

struct Entry {
    fields: BTreeMap<String, StateValue>,
    expires_at: Instant,
}

impl Entry {
    fn new(ttl: Duration) -> Self {
        Self {
            fields: BTreeMap::new(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process field-level state store with per-execution TTL.
///
/// Each execution is one hash of fields. All operations on one execution run
/// under its shard lock, so `increment` is atomic. Expired executions are
/// treated as absent on access and physically removed by the reaper.
pub struct MemoryStateStore {
    entries: DashMap<ExecutionId, Entry>,
    ttl: Duration,
}

impl MemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of executions currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired execution; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired executions until `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Expired execution state purged");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("State reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Run `f` against the live (non-expired) entry, creating it when absent,
    /// and refresh the TTL.
    fn with_entry<T>(&self, id: &ExecutionId, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<T> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| Entry::new(self.ttl));
        if entry.is_expired(now) {
            entry.fields.clear();
        }
        entry.expires_at = now + self.ttl;
        f(&mut entry)
    }

    /// Like `with_entry` but never creates an entry.
    fn read_entry<T>(&self, id: &ExecutionId, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = Instant::now();
        let mut entry = self.entries.get_mut(id)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at = now + self.ttl;
        Some(f(&entry))
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, execution: &ExecutionId, field: &str) -> BoxFuture<'_, Result<Option<StateValue>>> {
        let execution = execution.clone();
        let field = field.to_string();
        Box::pin(async move {
            Ok(self
                .read_entry(&execution, |entry| entry.fields.get(&field).cloned())
                .flatten())
        })
    }

    fn get_all(&self, execution: &ExecutionId) -> BoxFuture<'_, Result<BTreeMap<String, StateValue>>> {
        let execution = execution.clone();
        Box::pin(async move {
            Ok(self
                .read_entry(&execution, |entry| entry.fields.clone())
                .unwrap_or_default())
        })
    }

    fn set(&self, execution: &ExecutionId, field: &str, value: StateValue) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        let field = field.to_string();
        Box::pin(async move {
            self.with_entry(&execution, |entry| {
                entry.fields.insert(field, value);
                Ok(())
            })
        })
    }

    fn set_all(
        &self,
        execution: &ExecutionId,
        fields: BTreeMap<String, StateValue>,
    ) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            self.with_entry(&execution, |entry| {
                entry.fields.extend(fields);
                Ok(())
            })
        })
    }

    fn increment(&self, execution: &ExecutionId, field: &str, delta: i64) -> BoxFuture<'_, Result<i64>> {
        let execution = execution.clone();
        let field = field.to_string();
        Box::pin(async move {
            self.with_entry(&execution, |entry| {
                let current = match entry.fields.get(&field) {
                    None => 0,
                    Some(value) => value.as_counter().ok_or_else(|| {
                        StrataError::StateStore(format!("field '{field}' is not a counter"))
                    })?,
                };
                let next = current + delta;
                entry.fields.insert(field, StateValue::Counter(next));
                Ok(next)
            })
        })
    }

    fn append_to_list(
        &self,
        execution: &ExecutionId,
        field: &str,
        item: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        let field = field.to_string();
        Box::pin(async move {
            self.with_entry(&execution, |entry| {
                let mut list = match entry.fields.get(&field) {
                    None => Vec::new(),
                    Some(value) => match value.to_json()? {
                        serde_json::Value::Array(items) => items,
                        _ => {
                            return Err(StrataError::StateStore(format!(
                                "field '{field}' is not a list"
                            )))
                        }
                    },
                };
                list.push(item);
                entry
                    .fields
                    .insert(field, StateValue::json(&serde_json::Value::Array(list)));
                Ok(())
            })
        })
    }

    fn delete(&self, execution: &ExecutionId) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            self.entries.remove(&execution);
            Ok(())
        })
    }

    fn exists(&self, execution: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
        let execution = execution.clone();
        Box::pin(async move { Ok(self.read_entry(&execution, |_| ()).is_some()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStateStore::default();
        let id = ExecutionId::new();
        store
            .set(&id, "current_node", StateValue::Blob("\"a\"".into()))
            .await
            .unwrap();
        let value = store.get(&id, "current_node").await.unwrap().unwrap();
        assert_eq!(value.to_json().unwrap(), serde_json::json!("a"));
        assert!(store.get(&id, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_starts_at_zero() {
        let store = MemoryStateStore::default();
        let id = ExecutionId::new();
        assert_eq!(store.increment(&id, "step", 1).await.unwrap(), 1);
        assert_eq!(store.increment(&id, "step", 1).await.unwrap(), 2);
        assert_eq!(store.increment(&id, "step", 5).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(MemoryStateStore::default());
        let id = ExecutionId::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.increment(&id, "tool_calls", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let total = store.get(&id, "tool_calls").await.unwrap().unwrap();
        assert_eq!(total, StateValue::Counter(400));
    }

    #[tokio::test]
    async fn test_increment_rejects_blob() {
        let store = MemoryStateStore::default();
        let id = ExecutionId::new();
        store
            .set(&id, "data", StateValue::json(&serde_json::json!({"x": 1})))
            .await
            .unwrap();
        let err = store.increment(&id, "data", 1).await.unwrap_err();
        assert!(err.is_store_fatal());
    }

    #[tokio::test]
    async fn test_append_to_list() {
        let store = MemoryStateStore::default();
        let id = ExecutionId::new();
        store.append_to_list(&id, "warnings", serde_json::json!("one")).await.unwrap();
        store.append_to_list(&id, "warnings", serde_json::json!("two")).await.unwrap();
        let list = store.get(&id, "warnings").await.unwrap().unwrap();
        assert_eq!(list.to_json().unwrap(), serde_json::json!(["one", "two"]));
    }

    #[tokio::test]
    async fn test_delete_clears_execution() {
        let store = MemoryStateStore::default();
        let id = ExecutionId::new();
        store.increment(&id, "step", 1).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
        assert!(store.get_all(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_refresh() {
        let store = MemoryStateStore::new(Duration::from_millis(60));
        let id = ExecutionId::new();
        store.increment(&id, "step", 1).await.unwrap();

        // Touching within the TTL keeps the entry alive
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(store.exists(&id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(store.exists(&id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!store.exists(&id).await.unwrap());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_restarts_from_empty() {
        let store = MemoryStateStore::new(Duration::from_millis(20));
        let id = ExecutionId::new();
        store.increment(&id, "step", 4).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.increment(&id, "step", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_cancel() {
        let store = Arc::new(MemoryStateStore::new(Duration::from_millis(10)));
        store.increment(&ExecutionId::new(), "step", 1).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = store.spawn_reaper(Duration::from_millis(15), cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }
}
