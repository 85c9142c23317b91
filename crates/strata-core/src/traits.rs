use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// One unit of work a graph node or autonomous step can invoke.
pub trait Tool: Send + Sync + 'static {
    /// Registry name, referenced by graph nodes and decisions.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Operation class; selects the circuit breaker guarding this tool.
    fn class(&self) -> OperationClass;

    /// Position constraint inside a declared graph.
    fn position(&self) -> PositionConstraint {
        PositionConstraint::Any
    }

    /// Two-outcome branch tool; reports its branch via `ToolOutput::outcome`.
    fn conditional(&self) -> bool {
        false
    }

    /// Deadline for a single invocation, before degradation multipliers.
    fn timeout_secs(&self) -> u64 {
        60
    }

    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            class: self.class(),
            position: self.position(),
            conditional: self.conditional(),
        }
    }
}

/// Picks the next action of an autonomous run.
pub trait DecisionSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn decide(&self, request: DecisionRequest) -> BoxFuture<'_, Result<AgentDecision>>;
}

/// A single field value in the state store.
///
/// Counters are kept native so `increment` stays atomic; everything else
/// is stored as an opaque serialized blob.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Counter(i64),
    Blob(String),
}

impl StateValue {
    pub fn json(value: &serde_json::Value) -> Self {
        StateValue::Blob(value.to_string())
    }

    pub fn as_counter(&self) -> Option<i64> {
        match self {
            StateValue::Counter(n) => Some(*n),
            StateValue::Blob(s) => s.parse().ok(),
        }
    }

    /// Decode as JSON; counters come back as numbers.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            StateValue::Counter(n) => Ok(serde_json::Value::from(*n)),
            StateValue::Blob(s) => Ok(serde_json::from_str(s)?),
        }
    }
}

/// Field-level live state of executions, with per-execution TTL.
///
/// Every call refreshes the execution's TTL. Any error returned here is
/// execution-fatal for the caller.
pub trait StateStore: Send + Sync + 'static {
    fn get(&self, execution: &ExecutionId, field: &str)
        -> BoxFuture<'_, Result<Option<StateValue>>>;

    fn get_all(&self, execution: &ExecutionId)
        -> BoxFuture<'_, Result<BTreeMap<String, StateValue>>>;

    fn set(
        &self,
        execution: &ExecutionId,
        field: &str,
        value: StateValue,
    ) -> BoxFuture<'_, Result<()>>;

    fn set_all(
        &self,
        execution: &ExecutionId,
        fields: BTreeMap<String, StateValue>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Atomically add `delta` and return the new value. Missing fields start at zero.
    fn increment(&self, execution: &ExecutionId, field: &str, delta: i64)
        -> BoxFuture<'_, Result<i64>>;

    /// Read-modify-write append to a JSON list field. Not atomic across callers.
    fn append_to_list(
        &self,
        execution: &ExecutionId,
        field: &str,
        item: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>>;

    fn delete(&self, execution: &ExecutionId) -> BoxFuture<'_, Result<()>>;

    fn exists(&self, execution: &ExecutionId) -> BoxFuture<'_, Result<bool>>;
}

/// Durable, append-only checkpoint history plus execution summaries.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Append a batch; returns the number written.
    fn append(&self, checkpoints: &[Checkpoint]) -> BoxFuture<'_, Result<usize>>;

    /// Checkpoints of one execution ordered by step, optionally the last `limit`.
    fn history(
        &self,
        execution: &ExecutionId,
        limit: Option<usize>,
    ) -> BoxFuture<'_, Result<Vec<Checkpoint>>>;

    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Most recent first.
    fn list_executions(
        &self,
        session: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>>;
}

/// Outbound live progress channel for a session.
pub trait ProgressSink: Send + Sync + 'static {
    fn emit(&self, session: &SessionId, envelope: ProgressEnvelope) -> BoxFuture<'_, ()>;
}

/// Sink that drops everything; used when no live clients exist (CLI runs).
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _session: &SessionId, _envelope: ProgressEnvelope) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_value_json_roundtrip() {
        let value = StateValue::json(&serde_json::json!({"a": [1, 2]}));
        assert_eq!(value.to_json().unwrap(), serde_json::json!({"a": [1, 2]}));
    }

    #[test]
    fn test_counter_reads_as_number() {
        assert_eq!(StateValue::Counter(7).to_json().unwrap(), serde_json::json!(7));
        assert_eq!(StateValue::Blob("12".into()).as_counter(), Some(12));
        assert_eq!(StateValue::Blob("\"x\"".into()).as_counter(), None);
    }
}
