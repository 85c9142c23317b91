use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use strata_core::config::ExecutorConfig;
use strata_core::error::{Result, StrataError};
use strata_core::traits::{StateStore, Tool};
use strata_core::types::{
    Checkpoint, CheckpointKind, Condition, ErrorEntry, ErrorKind, ExecutionStatus,
    ProgressEnvelope, ProgressSubtype, Severity, ToolInput, ToolOutput,
};
use strata_store::CheckpointBuffer;
use strata_tools::ToolRegistry;

use crate::progress::ProgressEmitter;
use crate::resilience::{CircuitBreakers, DegradationController};
use crate::state::StateHandle;

/// Collaborators shared by both executor variants, built once at startup.
pub struct ExecutorDeps {
    pub tools: Arc<ToolRegistry>,
    pub state: Arc<dyn StateStore>,
    pub checkpoints: Arc<CheckpointBuffer>,
    pub breakers: Arc<CircuitBreakers>,
    pub degradation: Arc<DegradationController>,
    pub progress: Arc<ProgressEmitter>,
    pub config: ExecutorConfig,
}

/// Per-run handle passed to an executor.
pub struct RunContext {
    pub state: StateHandle,
    /// The execution's input payload.
    pub input: serde_json::Value,
    /// Fires on external cancellation; observed at step boundaries.
    pub cancel: CancellationToken,
    last_checkpoint: Mutex<Instant>,
}

impl RunContext {
    pub fn new(state: StateHandle, input: serde_json::Value, cancel: CancellationToken) -> Self {
        Self {
            state,
            input,
            cancel,
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn elapsed_since_checkpoint(&self) -> u64 {
        let mut last = self.last_checkpoint.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_millis() as u64;
        *last = now;
        elapsed
    }
}

/// How a run ended, as seen by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            result: None,
            error: None,
        }
    }
}

/// One way of driving an execution to a terminal status.
///
/// `Err` means the run was aborted by a store failure; every other ending,
/// including tool failures and cancellation, is a [`RunOutcome`].
pub trait GraphExecutor: Send + Sync {
    fn condition(&self) -> Condition;

    fn run<'a>(&'a self, ctx: &'a RunContext) -> BoxFuture<'a, Result<RunOutcome>>;
}

/// Degradation weight of a recorded failure.
pub fn severity_for(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::StoreFatal => Severity::Critical,
        ErrorKind::ToolCritical => Severity::High,
        ErrorKind::ToolNonCritical | ErrorKind::Timeout | ErrorKind::DecisionSource => {
            Severity::Normal
        }
        ErrorKind::CircuitOpen => Severity::Low,
    }
}

impl ExecutorDeps {
    /// Invoke a tool under its deadline and class breaker.
    ///
    /// The outer `Result` carries store failures only. The inner one is the
    /// tool's fate: soft failures reported in `ToolOutput` become
    /// `ToolExecution` errors here, after the breaker has seen a success.
    pub async fn invoke_tool(
        &self,
        ctx: &RunContext,
        tool: &Arc<dyn Tool>,
        node_id: Option<&str>,
        config: serde_json::Value,
    ) -> Result<std::result::Result<ToolOutput, StrataError>> {
        let input = ToolInput {
            execution_id: ctx.state.execution_id().clone(),
            session_id: ctx.state.session_id().clone(),
            node_id: node_id.map(str::to_string),
            config,
            payload: ctx.input.clone(),
            data: ctx.state.data().await?,
        };

        let base = Duration::from_secs(tool.timeout_secs().min(self.config.tool_timeout_secs));
        let timeout = self.degradation.policy().scale_timeout(base);
        let name = tool.name();

        debug!(
            execution_id = %ctx.state.execution_id(),
            tool = %name,
            class = %tool.class(),
            timeout_ms = timeout.as_millis() as u64,
            "Invoking tool"
        );

        let result = self
            .breakers
            .for_class(tool.class())
            .call(move || self.tools.execute(name, input, timeout))
            .await;

        Ok(match result {
            Ok(output) if output.success => Ok(output),
            Ok(output) => Err(StrataError::ToolExecution {
                tool: name.to_string(),
                message: output
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
            }),
            Err(e) => Err(e),
        })
    }

    /// Snapshot live state into a buffered checkpoint.
    pub async fn checkpoint(
        &self,
        ctx: &RunContext,
        kind: CheckpointKind,
        node_id: Option<&str>,
    ) -> Result<()> {
        // Nothing may follow the cancellation checkpoint
        if ctx.is_cancelled() && kind != CheckpointKind::Cancelled {
            return Ok(());
        }
        ctx.state.bump_checkpoints().await?;
        let snapshot = ctx.state.snapshot().await?;
        let checkpoint = Checkpoint {
            execution_id: ctx.state.execution_id().clone(),
            step: snapshot.step,
            kind,
            node_id: node_id.map(str::to_string),
            state: serde_json::to_value(&snapshot)?,
            created_at: Utc::now(),
            elapsed_ms: Some(ctx.elapsed_since_checkpoint()),
        };
        self.checkpoints.add(checkpoint, false).await?;
        Ok(())
    }

    /// Send a progress envelope for a running execution.
    pub async fn emit(
        &self,
        ctx: &RunContext,
        kind: &str,
        subtype: ProgressSubtype,
        step: u64,
        data: serde_json::Value,
    ) {
        let envelope = ProgressEnvelope::new(
            kind,
            subtype,
            ctx.state.execution_id().clone(),
            step,
            ExecutionStatus::Running,
        )
        .with_data(data);
        self.progress.emit(ctx.state.session_id(), envelope).await;
    }

    /// Record a failure everywhere it must be visible: the error list, the
    /// degradation window, the progress channel and an error checkpoint.
    pub async fn record_failure(
        &self,
        ctx: &RunContext,
        step: u64,
        node_id: Option<&str>,
        tool: Option<&str>,
        err: &StrataError,
        critical: bool,
    ) -> Result<()> {
        let kind = err.kind(critical);
        if critical {
            error!(
                execution_id = %ctx.state.execution_id(),
                step,
                node_id = ?node_id,
                tool = ?tool,
                error = %err,
                "Critical failure"
            );
        } else {
            warn!(
                execution_id = %ctx.state.execution_id(),
                step,
                node_id = ?node_id,
                tool = ?tool,
                kind = ?kind,
                error = %err,
                "Step failed, continuing"
            );
        }

        let entry = ErrorEntry {
            step,
            node_id: node_id.map(str::to_string),
            tool: tool.map(str::to_string),
            kind,
            message: err.to_string(),
            timestamp: Utc::now(),
        };
        ctx.state.record_error(&entry).await?;
        self.degradation.record_error(severity_for(kind));
        self.emit(
            ctx,
            if node_id.is_some() { "node" } else { "tool" },
            ProgressSubtype::Error,
            step,
            serde_json::to_value(&entry)?,
        )
        .await;
        self.checkpoint(ctx, CheckpointKind::Error, node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_for(ErrorKind::StoreFatal), Severity::Critical);
        assert_eq!(severity_for(ErrorKind::ToolCritical), Severity::High);
        assert_eq!(severity_for(ErrorKind::Timeout), Severity::Normal);
        assert_eq!(severity_for(ErrorKind::CircuitOpen), Severity::Low);
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(RunOutcome::cancelled().status, ExecutionStatus::Cancelled);
        let failed = RunOutcome::failed("boom");
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(RunOutcome::completed(serde_json::json!({})).result.is_some());
    }
}
