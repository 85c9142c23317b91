use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info, warn};

use strata_core::error::{Result, StrataError};
use strata_core::traits::DecisionSource;
use strata_core::types::{
    clamp_confidence, AgentDecision, CheckpointKind, Condition, DecisionOrigin, DecisionRequest,
    ExecutionState, NodeOutcome, OperationClass, ProgressSubtype,
};

use crate::decision::fallback_decision;
use crate::executor::{ExecutorDeps, GraphExecutor, RunContext, RunOutcome};

/// Attempts after which a failing class counts as done for the fallback rule.
const MAX_CLASS_FAILURES: usize = 2;

/// Bounded plan → execute → validate loop driven by a decision source.
///
/// Each iteration is one step: ask for the next action, record it, then run
/// the chosen tool. `finish`/`complete` or the step ceiling route to
/// validation. A failing or disabled decision source falls back to the
/// deterministic pipeline rule instead of failing the run.
pub struct AutonomousLoopExecutor {
    deps: Arc<ExecutorDeps>,
    decision: Option<Arc<dyn DecisionSource>>,
    goal: String,
}

impl AutonomousLoopExecutor {
    pub fn new(
        deps: Arc<ExecutorDeps>,
        decision: Option<Arc<dyn DecisionSource>>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            deps,
            decision,
            goal: goal.into(),
        }
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let execution_id = ctx.state.execution_id().clone();
        let ceiling = self.deps.config.max_autonomous_steps;
        let mut iterations = 0u64;

        loop {
            if ctx.is_cancelled() {
                info!(execution_id = %execution_id, "Cancellation observed");
                return Ok(RunOutcome::cancelled());
            }
            if iterations >= ceiling {
                warn!(execution_id = %execution_id, ceiling, "Step ceiling reached, validating");
                ctx.state
                    .add_warning(format!("step ceiling of {ceiling} reached"))
                    .await?;
                break;
            }
            iterations += 1;

            let step = ctx.state.next_step().await?;
            let decision = self.plan(ctx, step).await?;
            ctx.state.append_decision(&decision).await?;
            self.deps
                .checkpoint(ctx, CheckpointKind::AgentDecision, None)
                .await?;
            self.deps
                .emit(
                    ctx,
                    "decision",
                    ProgressSubtype::Progress,
                    step,
                    serde_json::to_value(&decision)?,
                )
                .await;

            if decision.is_finish() {
                debug!(execution_id = %execution_id, step, "Decision source finished");
                break;
            }

            self.act(ctx, step, &decision).await?;
        }

        if ctx.is_cancelled() {
            return Ok(RunOutcome::cancelled());
        }
        self.validate(ctx).await
    }

    /// Ask for the next action, falling back when the source is unusable.
    async fn plan(&self, ctx: &RunContext, step: u64) -> Result<AgentDecision> {
        let snapshot = ctx.state.snapshot().await?;
        let policy = self.deps.degradation.policy();

        let source = match &self.decision {
            Some(source) if policy.decisions_enabled => Some(source),
            Some(_) => {
                debug!(level = %policy.level, "Decision source disabled by degradation policy");
                None
            }
            None => None,
        };

        if let Some(source) = source {
            let request = DecisionRequest {
                execution_id: ctx.state.execution_id().clone(),
                goal: self.goal.clone(),
                step,
                data_keys: snapshot.data.keys().cloned().collect(),
                error_count: snapshot.errors.len(),
                completed_classes: succeeded_classes(&snapshot).into_iter().collect(),
                recent_decisions: ctx
                    .state
                    .recent_decisions(self.deps.config.decision_history)
                    .await?,
                tools: self.deps.tools.descriptors(),
            };
            let timeout =
                policy.scale_timeout(Duration::from_secs(self.deps.config.tool_timeout_secs));
            let result = self
                .deps
                .breakers
                .for_class(OperationClass::Decision)
                .call(move || async move {
                    tokio::time::timeout(timeout, source.decide(request))
                        .await
                        .map_err(|_| {
                            StrataError::DecisionSource(format!(
                                "timeout after {}ms",
                                timeout.as_millis()
                            ))
                        })?
                })
                .await;

            match result {
                Ok(mut decision) => {
                    decision.step = step;
                    decision.confidence = clamp_confidence(decision.confidence);
                    decision.origin = DecisionOrigin::Source;
                    return Ok(decision);
                }
                Err(e) => {
                    self.deps
                        .record_failure(ctx, step, None, Some(source.name()), &e, false)
                        .await?;
                }
            }
        }

        let mut decision = fallback_decision(&done_classes(&snapshot), &self.deps.tools);
        decision.step = step;
        Ok(decision)
    }

    /// Run the tool a decision chose. Failures are recorded, never fatal.
    async fn act(&self, ctx: &RunContext, step: u64, decision: &AgentDecision) -> Result<()> {
        let deps = &self.deps;
        let tool = match decision.tool.as_deref() {
            Some(name) => deps.tools.get(name).ok_or_else(|| StrataError::ToolNotFound(name.to_string())),
            None => Err(StrataError::ToolNotFound(format!(
                "decision '{}' names no tool",
                decision.action
            ))),
        };
        let tool = match tool {
            Ok(tool) => tool,
            Err(e) => {
                return deps
                    .record_failure(ctx, step, None, decision.tool.as_deref(), &e, false)
                    .await;
            }
        };

        let key = format!("{}#{}", tool.name(), step);
        deps.emit(ctx, "tool", ProgressSubtype::Start, step, json!({ "tool": tool.name(), "action": decision.action }))
            .await;

        let started = Instant::now();
        let result = deps
            .invoke_tool(
                ctx,
                &tool,
                None,
                json!({ "action": decision.action, "rationale": decision.rationale }),
            )
            .await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if ctx.is_cancelled() {
            return Ok(());
        }

        let succeeded = result.is_ok();
        let outcome = NodeOutcome {
            node_id: key.clone(),
            tool: tool.name().to_string(),
            class: tool.class(),
            succeeded,
            outcome: result.as_ref().ok().and_then(|o| o.outcome.clone()),
            step,
            elapsed_ms,
        };
        match result {
            Ok(output) => {
                ctx.state.merge_data(&key, &output.data).await?;
                ctx.state.record_outcome(&key, &outcome).await?;
                deps.degradation.record_success();
                deps.emit(
                    ctx,
                    "tool",
                    ProgressSubtype::End,
                    step,
                    json!({ "tool": tool.name(), "elapsedMs": elapsed_ms }),
                )
                .await;
            }
            Err(e) => {
                ctx.state.record_outcome(&key, &outcome).await?;
                deps.record_failure(ctx, step, None, Some(tool.name()), &e, false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Store the terminal summary and complete.
    async fn validate(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let snapshot = ctx.state.snapshot().await?;
        let usable = snapshot.node_results.values().any(|o| {
            o.succeeded && matches!(o.class, OperationClass::Generation | OperationClass::Output)
        });
        let summary = json!({
            "goal": self.goal,
            "steps_taken": snapshot.step,
            "error_count": snapshot.errors.len(),
            "usable_output": usable,
            "decisions": snapshot.decisions.len(),
        });
        info!(
            execution_id = %ctx.state.execution_id(),
            steps = snapshot.step,
            errors = snapshot.errors.len(),
            usable,
            "Autonomous run validated"
        );
        ctx.state
            .merge_data("validation", &json!({ "validation": summary }))
            .await?;

        let data = ctx.state.data().await?;
        Ok(RunOutcome::completed(serde_json::Value::Object(
            data.into_iter().collect(),
        )))
    }
}

fn succeeded_classes(state: &ExecutionState) -> BTreeSet<OperationClass> {
    state
        .node_results
        .values()
        .filter(|o| o.succeeded)
        .map(|o| o.class)
        .collect()
}

/// Classes that succeeded or failed too often to try again.
fn done_classes(state: &ExecutionState) -> BTreeSet<OperationClass> {
    let mut failures: BTreeMap<OperationClass, usize> = BTreeMap::new();
    for o in state.node_results.values().filter(|o| !o.succeeded) {
        *failures.entry(o.class).or_default() += 1;
    }
    let mut done = succeeded_classes(state);
    done.extend(
        failures
            .into_iter()
            .filter(|(_, n)| *n >= MAX_CLASS_FAILURES)
            .map(|(class, _)| class),
    );
    done
}

impl GraphExecutor for AutonomousLoopExecutor {
    fn condition(&self) -> Condition {
        Condition::Autonomous
    }

    fn run<'a>(&'a self, ctx: &'a RunContext) -> BoxFuture<'a, Result<RunOutcome>> {
        Box::pin(async move {
            let outcome = self.execute(ctx).await;
            if let Err(e) = &outcome {
                warn!(execution_id = %ctx.state.execution_id(), error = %e, "Autonomous loop aborted");
            }
            outcome
        })
    }
}
