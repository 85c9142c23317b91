use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use strata_core::error::{Result, StrataError};
use strata_core::traits::{StateStore, StateValue};
use strata_core::types::{
    AgentDecision, Condition, ErrorEntry, ExecutionId, ExecutionState, ExecutionStatus,
    NodeOutcome, SessionId,
};

const STEP: &str = "step";
const STATUS: &str = "status";
const CURRENT_NODE: &str = "current_node";
const ERRORS: &str = "errors";
const WARNINGS: &str = "warnings";
const DECISIONS: &str = "decisions";
const TOOL_CALLS: &str = "tool_calls";
const CHECKPOINTS: &str = "checkpoints";
const CONDITION: &str = "condition";
const SESSION: &str = "session_id";
const STARTED_AT: &str = "started_at";
const DATA_PREFIX: &str = "data:";
const NODE_PREFIX: &str = "node:";
const TIMING_PREFIX: &str = "timing:";

/// Typed accessor over one execution's fields in the state store.
///
/// All mutation of live execution state goes through here. Working data keys,
/// node outcomes and timings each live in their own field, so concurrent
/// writers only race at field granularity.
#[derive(Clone)]
pub struct StateHandle {
    store: Arc<dyn StateStore>,
    execution_id: ExecutionId,
    session_id: SessionId,
    condition: Condition,
}

impl StateHandle {
    pub fn new(
        store: Arc<dyn StateStore>,
        execution_id: ExecutionId,
        session_id: SessionId,
        condition: Condition,
    ) -> Self {
        Self {
            store,
            execution_id,
            session_id,
            condition,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Seed the state of a new execution.
    pub async fn init(&self, started_at: DateTime<Utc>) -> Result<()> {
        let mut fields = BTreeMap::new();
        fields.insert(STEP.to_string(), StateValue::Counter(0));
        fields.insert(TOOL_CALLS.to_string(), StateValue::Counter(0));
        fields.insert(CHECKPOINTS.to_string(), StateValue::Counter(0));
        fields.insert(STATUS.to_string(), blob(&ExecutionStatus::Running)?);
        fields.insert(CONDITION.to_string(), blob(&self.condition)?);
        fields.insert(SESSION.to_string(), blob(&self.session_id)?);
        fields.insert(STARTED_AT.to_string(), blob(&started_at)?);
        fields.insert(ERRORS.to_string(), StateValue::Blob("[]".into()));
        fields.insert(WARNINGS.to_string(), StateValue::Blob("[]".into()));
        fields.insert(DECISIONS.to_string(), StateValue::Blob("[]".into()));
        self.store.set_all(&self.execution_id, fields).await
    }

    /// Atomically advance the step counter; the returned value numbers the step.
    pub async fn next_step(&self) -> Result<u64> {
        let step = self.store.increment(&self.execution_id, STEP, 1).await?;
        Ok(step.max(0) as u64)
    }

    pub async fn step(&self) -> Result<u64> {
        let value = self.store.get(&self.execution_id, STEP).await?;
        Ok(value.and_then(|v| v.as_counter()).unwrap_or(0).max(0) as u64)
    }

    pub async fn set_current_node(&self, node_id: &str) -> Result<()> {
        self.store
            .set(&self.execution_id, CURRENT_NODE, blob(&node_id)?)
            .await
    }

    pub async fn set_status(&self, status: ExecutionStatus) -> Result<()> {
        self.store.set(&self.execution_id, STATUS, blob(&status)?).await
    }

    pub async fn status(&self) -> Result<Option<ExecutionStatus>> {
        self.read(STATUS).await
    }

    /// Working data accumulated so far.
    pub async fn data(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let fields = self.store.get_all(&self.execution_id).await?;
        let mut data = BTreeMap::new();
        for (field, value) in fields {
            if let Some(key) = field.strip_prefix(DATA_PREFIX) {
                data.insert(key.to_string(), decode(&field, &value)?);
            }
        }
        Ok(data)
    }

    /// Merge a tool result into working data.
    ///
    /// Object results contribute their top-level keys; anything else is
    /// stored whole under `key`. Null results change nothing.
    pub async fn merge_data(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut fields = BTreeMap::new();
        match value {
            serde_json::Value::Null => return Ok(()),
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    fields.insert(format!("{DATA_PREFIX}{k}"), StateValue::json(v));
                }
            }
            other => {
                fields.insert(format!("{DATA_PREFIX}{key}"), StateValue::json(other));
            }
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.store.set_all(&self.execution_id, fields).await
    }

    pub async fn record_error(&self, entry: &ErrorEntry) -> Result<()> {
        self.store
            .append_to_list(&self.execution_id, ERRORS, serde_json::to_value(entry)?)
            .await
    }

    pub async fn errors(&self) -> Result<Vec<ErrorEntry>> {
        Ok(self.read(ERRORS).await?.unwrap_or_default())
    }

    pub async fn add_warning(&self, warning: impl Into<String>) -> Result<()> {
        self.store
            .append_to_list(
                &self.execution_id,
                WARNINGS,
                serde_json::Value::String(warning.into()),
            )
            .await
    }

    /// Record the outcome of a node or tool call and count the call.
    pub async fn record_outcome(&self, key: &str, outcome: &NodeOutcome) -> Result<()> {
        let mut fields = BTreeMap::new();
        fields.insert(format!("{NODE_PREFIX}{key}"), blob(outcome)?);
        fields.insert(
            format!("{TIMING_PREFIX}{key}"),
            StateValue::Counter(outcome.elapsed_ms as i64),
        );
        self.store.set_all(&self.execution_id, fields).await?;
        self.store.increment(&self.execution_id, TOOL_CALLS, 1).await?;
        Ok(())
    }

    /// Outcome recorded for `key`, read back from the store.
    pub async fn outcome(&self, key: &str) -> Result<Option<NodeOutcome>> {
        self.read(&format!("{NODE_PREFIX}{key}")).await
    }

    pub async fn append_decision(&self, decision: &AgentDecision) -> Result<()> {
        self.store
            .append_to_list(&self.execution_id, DECISIONS, serde_json::to_value(decision)?)
            .await
    }

    /// The last `n` decisions, oldest first.
    pub async fn recent_decisions(&self, n: usize) -> Result<Vec<AgentDecision>> {
        let all: Vec<AgentDecision> = self.read(DECISIONS).await?.unwrap_or_default();
        let skip = all.len().saturating_sub(n);
        Ok(all.into_iter().skip(skip).collect())
    }

    pub async fn bump_checkpoints(&self) -> Result<u64> {
        let n = self.store.increment(&self.execution_id, CHECKPOINTS, 1).await?;
        Ok(n.max(0) as u64)
    }

    /// Reconstruct the full execution state from its fields.
    pub async fn snapshot(&self) -> Result<ExecutionState> {
        let fields = self.store.get_all(&self.execution_id).await?;
        if fields.is_empty() {
            return Err(StrataError::StateStore(format!(
                "no live state for execution {}",
                self.execution_id
            )));
        }

        let mut state = ExecutionState::new(
            self.execution_id.clone(),
            self.session_id.clone(),
            self.condition,
        );
        for (field, value) in &fields {
            match field.as_str() {
                STEP => state.step = counter(value),
                TOOL_CALLS => state.tool_calls = counter(value),
                CHECKPOINTS => state.checkpoints = counter(value),
                STATUS => state.status = parse(field, value)?,
                CURRENT_NODE => state.current_node = Some(parse(field, value)?),
                STARTED_AT => state.started_at = parse(field, value)?,
                ERRORS => state.errors = parse(field, value)?,
                WARNINGS => state.warnings = parse(field, value)?,
                DECISIONS => state.decisions = parse(field, value)?,
                CONDITION | SESSION => {}
                other => {
                    if let Some(key) = other.strip_prefix(DATA_PREFIX) {
                        state.data.insert(key.to_string(), decode(field, value)?);
                    } else if let Some(key) = other.strip_prefix(NODE_PREFIX) {
                        state.node_results.insert(key.to_string(), parse(field, value)?);
                    } else if let Some(key) = other.strip_prefix(TIMING_PREFIX) {
                        state.timings_ms.insert(key.to_string(), counter(value));
                    }
                }
            }
        }
        Ok(state)
    }

    /// Drop the execution's live state.
    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&self.execution_id).await
    }

    async fn read<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        match self.store.get(&self.execution_id, field).await? {
            Some(value) => Ok(Some(parse(field, &value)?)),
            None => Ok(None),
        }
    }
}

fn blob<T: serde::Serialize + ?Sized>(value: &T) -> Result<StateValue> {
    Ok(StateValue::Blob(serde_json::to_string(value)?))
}

fn counter(value: &StateValue) -> u64 {
    value.as_counter().unwrap_or(0).max(0) as u64
}

fn decode(field: &str, value: &StateValue) -> Result<serde_json::Value> {
    value
        .to_json()
        .map_err(|e| StrataError::StateStore(format!("corrupt field '{field}': {e}")))
}

fn parse<T: DeserializeOwned>(field: &str, value: &StateValue) -> Result<T> {
    serde_json::from_value(decode(field, value)?)
        .map_err(|e| StrataError::StateStore(format!("corrupt field '{field}': {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strata_core::types::{ErrorKind, OperationClass};
    use strata_store::MemoryStateStore;
    use strata_test_utils::FailingStateStore;

    use super::*;

    fn handle() -> StateHandle {
        StateHandle::new(
            Arc::new(MemoryStateStore::default()),
            ExecutionId::new(),
            SessionId::from_string("s1"),
            Condition::Declared,
        )
    }

    #[tokio::test]
    async fn test_init_and_snapshot() {
        let h = handle();
        h.init(Utc::now()).await.unwrap();
        let state = h.snapshot().await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Running);
        assert_eq!(state.step, 0);
        assert!(state.errors.is_empty());
        assert_eq!(state.session_id.as_str(), "s1");
    }

    #[tokio::test]
    async fn test_steps_are_monotonic_across_tasks() {
        let h = handle();
        h.init(Utc::now()).await.unwrap();
        let mut tasks = vec![];
        for _ in 0..20 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move { h.next_step().await.unwrap() }));
        }
        let mut steps = vec![];
        for t in tasks {
            steps.push(t.await.unwrap());
        }
        steps.sort_unstable();
        assert_eq!(steps, (1..=20).collect::<Vec<u64>>());
        assert_eq!(h.step().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_merge_data_flattens_objects() {
        let h = handle();
        h.init(Utc::now()).await.unwrap();
        h.merge_data("load", &json!({"records": [1, 2], "record_count": 2}))
            .await
            .unwrap();
        h.merge_data("scalar", &json!(42)).await.unwrap();
        h.merge_data("nothing", &serde_json::Value::Null).await.unwrap();

        let data = h.data().await.unwrap();
        assert_eq!(data["records"], json!([1, 2]));
        assert_eq!(data["record_count"], json!(2));
        assert_eq!(data["scalar"], json!(42));
        assert!(!data.contains_key("nothing"));
    }

    #[tokio::test]
    async fn test_outcome_roundtrip_and_tool_call_count() {
        let h = handle();
        h.init(Utc::now()).await.unwrap();
        let outcome = NodeOutcome {
            node_id: "n2".into(),
            tool: "branch_on".into(),
            class: OperationClass::Analysis,
            succeeded: true,
            outcome: Some("true".into()),
            step: 2,
            elapsed_ms: 7,
        };
        h.record_outcome("n2", &outcome).await.unwrap();
        assert_eq!(h.outcome("n2").await.unwrap(), Some(outcome));
        assert_eq!(h.outcome("n9").await.unwrap(), None);

        let state = h.snapshot().await.unwrap();
        assert_eq!(state.tool_calls, 1);
        assert_eq!(state.timings_ms["n2"], 7);
    }

    #[tokio::test]
    async fn test_errors_and_recent_decisions() {
        let h = handle();
        h.init(Utc::now()).await.unwrap();
        h.record_error(&ErrorEntry {
            step: 3,
            node_id: Some("n3".into()),
            tool: Some("middle_b".into()),
            kind: ErrorKind::ToolNonCritical,
            message: "boom".into(),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
        for i in 0..5 {
            let mut d = AgentDecision::new("analyze", None, format!("r{i}"), 0.5);
            d.step = i;
            h.append_decision(&d).await.unwrap();
        }

        assert_eq!(h.errors().await.unwrap().len(), 1);
        let recent = h.recent_decisions(3).await.unwrap();
        assert_eq!(
            recent.iter().map(|d| d.step).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[tokio::test]
    async fn test_snapshot_after_clear_is_store_error() {
        let h = handle();
        h.init(Utc::now()).await.unwrap();
        h.clear().await.unwrap();
        assert!(h.snapshot().await.unwrap_err().is_store_fatal());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_fatal() {
        let h = StateHandle::new(
            Arc::new(FailingStateStore),
            ExecutionId::new(),
            SessionId::new(),
            Condition::Autonomous,
        );
        assert!(h.next_step().await.unwrap_err().is_store_fatal());
        assert!(h.init(Utc::now()).await.unwrap_err().is_store_fatal());
    }
}
