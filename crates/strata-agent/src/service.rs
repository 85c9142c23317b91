use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::error::{Result, StrataError};
use strata_core::event::EventBus;
use strata_core::traits::{CheckpointStore, DecisionSource};
use strata_core::types::{
    Checkpoint, CheckpointKind, CircuitSnapshot, Condition, DegradationLevel, Execution,
    ExecutionId, ExecutionState, ExecutionStatus, ProgressEnvelope, ProgressSubtype, SessionId,
    Severity, SystemEvent, WorkflowGraph,
};

use crate::autonomous::AutonomousLoopExecutor;
use crate::executor::{ExecutorDeps, GraphExecutor, RunContext, RunOutcome};
use crate::graph::{validate, DeclaredGraphExecutor};
use crate::state::StateHandle;

/// Goal used for autonomous runs started without one.
pub const DEFAULT_GOAL: &str = "Process the input and produce a summary";

/// Request to start an execution.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub condition: Condition,
    /// Required for declared runs.
    #[serde(default)]
    pub graph: Option<WorkflowGraph>,
    /// Free-text task for autonomous runs.
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
}

/// Answer to a status poll.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatusReport {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub current_step: u64,
    pub progress_pct: f64,
    pub current_node: Option<String>,
    pub error_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub level: DegradationLevel,
    pub pinned: bool,
    pub breakers: Vec<CircuitSnapshot>,
    pub active_executions: usize,
    pub pending_checkpoints: usize,
}

struct ActiveRun {
    ctx: Arc<RunContext>,
    record: Execution,
    /// Nodes (declared) or step ceiling (autonomous), for progress percentages.
    total_steps: u64,
    status_tx: watch::Sender<ExecutionStatus>,
    /// Claimed by whichever of normal completion and cancellation gets there first.
    finalizing: AtomicBool,
}

impl ActiveRun {
    fn claim(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Creates executions, runs them on the right executor and finalizes their records.
pub struct OrchestrationService {
    deps: Arc<ExecutorDeps>,
    store: Arc<dyn CheckpointStore>,
    decision: Option<Arc<dyn DecisionSource>>,
    events: Arc<EventBus>,
    active: DashMap<ExecutionId, Arc<ActiveRun>>,
}

impl OrchestrationService {
    pub fn new(
        deps: Arc<ExecutorDeps>,
        store: Arc<dyn CheckpointStore>,
        decision: Option<Arc<dyn DecisionSource>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            deps,
            store,
            decision,
            events,
            active: DashMap::new(),
        }
    }

    pub fn deps(&self) -> &Arc<ExecutorDeps> {
        &self.deps
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: &ExecutionId) -> bool {
        self.active.contains_key(id)
    }

    /// Validate, record and launch an execution; returns once it is running.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<StartResponse> {
        let policy = self.deps.degradation.policy();
        if self.active.len() >= policy.max_concurrent {
            warn!(
                active = self.active.len(),
                limit = policy.max_concurrent,
                level = %policy.level,
                "Execution rejected by admission control"
            );
            return Err(StrataError::ExecutionRejected(format!(
                "{} executions active, limit is {} at level {}",
                self.active.len(),
                policy.max_concurrent,
                policy.level
            )));
        }

        let (executor, total_steps, goal): (Box<dyn GraphExecutor>, u64, Option<String>) =
            match request.condition {
                Condition::Declared => {
                    let graph = request.graph.as_ref().ok_or_else(|| {
                        StrataError::GraphValidation("declared execution requires a graph".into())
                    })?;
                    let validated = validate(graph, &self.deps.tools)?;
                    let total = validated.len() as u64;
                    (
                        Box::new(DeclaredGraphExecutor::new(Arc::clone(&self.deps), validated)),
                        total,
                        None,
                    )
                }
                Condition::Autonomous => {
                    let goal = request
                        .goal
                        .clone()
                        .filter(|g| !g.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_GOAL.to_string());
                    (
                        Box::new(AutonomousLoopExecutor::new(
                            Arc::clone(&self.deps),
                            self.decision.clone(),
                            goal.clone(),
                        )),
                        self.deps.config.max_autonomous_steps,
                        Some(goal),
                    )
                }
            };

        // Degraded levels batch more checkpoints per write, never fewer than configured
        let base = self.deps.checkpoints.base_batch();
        let batch = if policy.level == DegradationLevel::Full {
            base
        } else {
            base.max(policy.checkpoint_batch)
        };
        self.deps.checkpoints.set_max_batch(batch).await;

        let mut record = Execution::new(
            request.session_id.clone(),
            request.condition,
            request.input.clone(),
        );
        record.status = ExecutionStatus::Running;
        self.store.save_execution(&record).await?;

        let state = StateHandle::new(
            Arc::clone(&self.deps.state),
            record.id.clone(),
            record.session_id.clone(),
            record.condition,
        );
        let ctx = Arc::new(RunContext::new(
            state,
            request.input,
            CancellationToken::new(),
        ));

        let begun = async {
            ctx.state.init(record.started_at).await?;
            self.deps
                .checkpoint(&ctx, CheckpointKind::ExecutionStart, None)
                .await
        }
        .await;
        if let Err(e) = begun {
            error!(execution_id = %record.id, error = %e, "Execution could not start");
            self.deps.degradation.record_error(Severity::Critical);
            record.status = ExecutionStatus::Failed;
            record.error = Some(e.to_string());
            record.completed_at = Some(Utc::now());
            if let Err(save_err) = self.store.save_execution(&record).await {
                warn!(execution_id = %record.id, error = %save_err, "Failed to record start failure");
            }
            return Err(e);
        }

        let execution_id = record.id.clone();
        let (status_tx, _) = watch::channel(ExecutionStatus::Running);
        let run = Arc::new(ActiveRun {
            ctx: Arc::clone(&ctx),
            record,
            total_steps,
            status_tx,
            finalizing: AtomicBool::new(false),
        });
        self.active.insert(execution_id.clone(), Arc::clone(&run));

        info!(
            execution_id = %execution_id,
            session_id = %run.record.session_id,
            condition = %run.record.condition,
            "Execution started"
        );
        self.deps
            .emit(
                &ctx,
                "execution",
                ProgressSubtype::Start,
                0,
                json!({ "condition": run.record.condition, "goal": goal }),
            )
            .await;
        self.events.publish(SystemEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            session_id: run.record.session_id.clone(),
            condition: run.record.condition,
        });

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = executor.run(&run.ctx).await;
            service.finalize(&run, outcome).await;
        });

        Ok(StartResponse {
            execution_id,
            status: ExecutionStatus::Running,
        })
    }

    /// Start an execution and wait for its terminal record.
    pub async fn run_to_completion(self: &Arc<Self>, request: StartRequest) -> Result<Execution> {
        let started = self.start(request).await?;
        self.wait(&started.execution_id).await
    }

    /// Wait until an execution is terminal and return its durable record.
    pub async fn wait(&self, id: &ExecutionId) -> Result<Execution> {
        let run = self.active.get(id).map(|r| Arc::clone(r.value()));
        if let Some(run) = run {
            let mut rx = run.status_tx.subscribe();
            // A dropped sender means the run is gone; the record tells the rest
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        }
        self.store
            .load_execution(id)
            .await?
            .ok_or_else(|| StrataError::ExecutionNotFound(id.to_string()))
    }

    async fn finalize(&self, run: &ActiveRun, outcome: Result<RunOutcome>) {
        if !run.claim() {
            debug!(execution_id = %run.record.id, "Execution already finalized by cancellation");
            return;
        }
        let ctx = &run.ctx;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(execution_id = %run.record.id, error = %e, "Execution aborted by store failure");
                self.deps.degradation.record_error(Severity::Critical);
                RunOutcome::failed(e.to_string())
            }
        };

        let closed = async {
            ctx.state.set_status(outcome.status).await?;
            self.deps
                .checkpoint(ctx, CheckpointKind::ExecutionEnd, None)
                .await?;
            ctx.state.snapshot().await
        }
        .await;
        let snapshot = match closed {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(execution_id = %run.record.id, error = %e, "Could not write final state");
                None
            }
        };
        if let Err(e) = self.deps.checkpoints.flush_for(&run.record.id).await {
            warn!(execution_id = %run.record.id, error = %e, "Final checkpoint flush failed");
        }

        let mut record = run.record.clone();
        record.status = outcome.status;
        record.result = outcome.result;
        record.error = outcome.error;
        self.close(run, record, snapshot.as_ref()).await;
    }

    /// Persist the terminal record, notify everyone and drop the live state.
    async fn close(&self, run: &ActiveRun, mut record: Execution, snapshot: Option<&ExecutionState>) {
        let ctx = &run.ctx;
        record.completed_at = Some(Utc::now());
        if let Some(s) = snapshot {
            record.steps_completed = s.step;
            record.checkpoints_written = s.checkpoints;
            record.tool_calls = s.tool_calls;
        }
        if let Err(e) = self.store.save_execution(&record).await {
            error!(execution_id = %record.id, error = %e, "Failed to save execution record");
        }

        let subtype = if record.status == ExecutionStatus::Failed {
            ProgressSubtype::Error
        } else {
            ProgressSubtype::End
        };
        let envelope = ProgressEnvelope::new(
            "execution",
            subtype,
            record.id.clone(),
            record.steps_completed,
            record.status,
        )
        .with_data(json!({ "result": record.result, "error": record.error }));
        self.deps.progress.emit(&record.session_id, envelope).await;
        self.deps.progress.forget(&record.id);

        if let Err(e) = ctx.state.clear().await {
            warn!(execution_id = %record.id, error = %e, "Failed to clear live state");
        }

        info!(
            execution_id = %record.id,
            status = %record.status,
            steps = record.steps_completed,
            checkpoints = record.checkpoints_written,
            "Execution finished"
        );
        self.events.publish(SystemEvent::ExecutionFinished {
            execution_id: record.id.clone(),
            session_id: record.session_id.clone(),
            status: record.status,
        });
        run.status_tx.send_replace(record.status);
        self.active.remove(&record.id);
    }

    /// Cancel a running execution.
    ///
    /// Buffered checkpoints of the execution are flushed, ending in a
    /// `cancelled` checkpoint, before its live state is deleted. The executor
    /// notices at its next step boundary; an in-flight tool call is not
    /// interrupted.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<()> {
        let run = match self.active.get(id).map(|r| Arc::clone(r.value())) {
            Some(run) => run,
            None => {
                return match self.store.load_execution(id).await? {
                    Some(record) => Err(StrataError::ExecutionRejected(format!(
                        "execution {id} is already {}",
                        record.status
                    ))),
                    None => Err(StrataError::ExecutionNotFound(id.to_string())),
                };
            }
        };
        if !run.claim() {
            return Err(StrataError::ExecutionRejected(format!(
                "execution {id} is already finishing"
            )));
        }

        info!(execution_id = %id, "Cancelling execution");
        let ctx = &run.ctx;
        if let Err(e) = ctx.state.set_status(ExecutionStatus::Cancelled).await {
            warn!(execution_id = %id, error = %e, "Could not mark state cancelled");
        }
        ctx.cancel.cancel();

        if let Err(e) = self
            .deps
            .checkpoint(ctx, CheckpointKind::Cancelled, None)
            .await
        {
            warn!(execution_id = %id, error = %e, "Could not write cancellation checkpoint");
        }
        let snapshot = ctx.state.snapshot().await.ok();
        match self.deps.checkpoints.flush_for(id).await {
            Ok(n) => debug!(execution_id = %id, flushed = n, "Checkpoints flushed on cancel"),
            Err(e) => warn!(execution_id = %id, error = %e, "Checkpoint flush on cancel failed"),
        }

        let mut record = run.record.clone();
        record.status = ExecutionStatus::Cancelled;
        self.close(&run, record, snapshot.as_ref()).await;
        Ok(())
    }

    /// Record an external intervention into a running execution.
    pub async fn intervene(&self, id: &ExecutionId, payload: serde_json::Value) -> Result<()> {
        let run = self
            .active
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StrataError::ExecutionNotFound(id.to_string()))?;
        run.ctx
            .state
            .merge_data("intervention", &json!({ "intervention": payload }))
            .await?;
        self.deps
            .checkpoint(&run.ctx, CheckpointKind::UserIntervention, None)
            .await
    }

    pub async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatusReport> {
        if let Some(run) = self.active.get(id).map(|r| Arc::clone(r.value())) {
            if let Ok(snapshot) = run.ctx.state.snapshot().await {
                let done = match run.record.condition {
                    Condition::Declared => snapshot.node_results.len() as u64,
                    Condition::Autonomous => snapshot.step,
                };
                let progress_pct = if run.total_steps == 0 {
                    0.0
                } else {
                    (done as f64 / run.total_steps as f64 * 100.0).min(100.0)
                };
                return Ok(ExecutionStatusReport {
                    execution_id: id.clone(),
                    status: snapshot.status,
                    current_step: snapshot.step,
                    progress_pct,
                    current_node: snapshot.current_node,
                    error_count: snapshot.errors.len(),
                    started_at: run.record.started_at,
                    completed_at: None,
                    error: None,
                });
            }
        }

        let record = self
            .store
            .load_execution(id)
            .await?
            .ok_or_else(|| StrataError::ExecutionNotFound(id.to_string()))?;
        Ok(ExecutionStatusReport {
            execution_id: record.id,
            status: record.status,
            current_step: record.steps_completed,
            progress_pct: if record.status == ExecutionStatus::Completed { 100.0 } else { 0.0 },
            current_node: None,
            error_count: usize::from(record.error.is_some()),
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error,
        })
    }

    /// Checkpoint history, ordered by step. Pending checkpoints of a live run are flushed first.
    pub async fn history(&self, id: &ExecutionId, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        if self.active.contains_key(id) {
            self.deps.checkpoints.flush_for(id).await?;
        }
        self.store.history(id, limit).await
    }

    pub async fn list(&self, session: &SessionId, limit: usize) -> Result<Vec<Execution>> {
        self.store.list_executions(session, limit).await
    }

    pub async fn load(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        self.store.load_execution(id).await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            level: self.deps.degradation.level(),
            pinned: self.deps.degradation.pinned().is_some(),
            breakers: self.deps.breakers.snapshot(),
            active_executions: self.active.len(),
            pending_checkpoints: self.deps.checkpoints.pending().await,
        }
    }

    /// Cancel everything still running and flush all buffered checkpoints.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<ExecutionId> = self.active.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Cancelling active executions for shutdown");
        }
        for id in ids {
            if let Err(e) = self.cancel(&id).await {
                debug!(execution_id = %id, error = %e, "Skipped during shutdown");
            }
        }
        self.deps.checkpoints.shutdown_flush().await?;
        Ok(())
    }
}
