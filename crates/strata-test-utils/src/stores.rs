use std::collections::BTreeMap;

use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::{CheckpointStore, StateStore, StateValue};
use strata_core::types::{Checkpoint, Execution, ExecutionId, SessionId};

/// State store that is always unreachable.
pub struct FailingStateStore;

fn unavailable<T: Send + 'static>() -> BoxFuture<'static, Result<T>> {
    Box::pin(async { Err(StrataError::StateStore("connection refused".into())) })
}

impl StateStore for FailingStateStore {
    fn get(&self, _: &ExecutionId, _: &str) -> BoxFuture<'_, Result<Option<StateValue>>> {
        unavailable()
    }
    fn get_all(&self, _: &ExecutionId) -> BoxFuture<'_, Result<BTreeMap<String, StateValue>>> {
        unavailable()
    }
    fn set(&self, _: &ExecutionId, _: &str, _: StateValue) -> BoxFuture<'_, Result<()>> {
        unavailable()
    }
    fn set_all(&self, _: &ExecutionId, _: BTreeMap<String, StateValue>) -> BoxFuture<'_, Result<()>> {
        unavailable()
    }
    fn increment(&self, _: &ExecutionId, _: &str, _: i64) -> BoxFuture<'_, Result<i64>> {
        unavailable()
    }
    fn append_to_list(&self, _: &ExecutionId, _: &str, _: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        unavailable()
    }
    fn delete(&self, _: &ExecutionId) -> BoxFuture<'_, Result<()>> {
        unavailable()
    }
    fn exists(&self, _: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
        unavailable()
    }
}

/// Checkpoint store whose every call fails.
pub struct FailingCheckpointStore;

fn locked<T: Send + 'static>() -> BoxFuture<'static, Result<T>> {
    Box::pin(async { Err(StrataError::CheckpointStore("database is locked".into())) })
}

impl CheckpointStore for FailingCheckpointStore {
    fn append(&self, _: &[Checkpoint]) -> BoxFuture<'_, Result<usize>> {
        locked()
    }
    fn history(&self, _: &ExecutionId, _: Option<usize>) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        locked()
    }
    fn save_execution(&self, _: &Execution) -> BoxFuture<'_, Result<()>> {
        locked()
    }
    fn load_execution(&self, _: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        locked()
    }
    fn list_executions(&self, _: &SessionId, _: usize) -> BoxFuture<'_, Result<Vec<Execution>>> {
        locked()
    }
}
