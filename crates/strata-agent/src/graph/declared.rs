use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info, warn};

use strata_core::error::{Result, StrataError};
use strata_core::types::{CheckpointKind, Condition, NodeOutcome, ProgressSubtype};

use super::validate::ValidatedGraph;
use crate::executor::{ExecutorDeps, GraphExecutor, RunContext, RunOutcome};

/// Outcome label assumed for a conditional node that failed.
pub const FAILED_BRANCH: &str = "false";

/// Runs a validated, user-authored DAG in topological order.
///
/// A node runs only once one of its incoming edges has been activated.
/// Unlabeled edges activate on completion of their source; labeled edges
/// only when the label equals the source's recorded outcome.
pub struct DeclaredGraphExecutor {
    deps: Arc<ExecutorDeps>,
    graph: ValidatedGraph,
}

impl DeclaredGraphExecutor {
    pub fn new(deps: Arc<ExecutorDeps>, graph: ValidatedGraph) -> Self {
        Self { deps, graph }
    }

    pub fn graph(&self) -> &ValidatedGraph {
        &self.graph
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let deps = &self.deps;
        let execution_id = ctx.state.execution_id().clone();
        let mut active: HashSet<&str> = HashSet::from([self.graph.entry()]);

        for node_id in &self.graph.order {
            if ctx.is_cancelled() {
                info!(execution_id = %execution_id, node_id = %node_id, "Cancellation observed");
                return Ok(RunOutcome::cancelled());
            }

            let critical = self.graph.is_critical(node_id);
            if !active.contains(node_id.as_str()) {
                if critical {
                    return Ok(RunOutcome::failed(format!(
                        "terminal node '{node_id}' was never reached"
                    )));
                }
                debug!(execution_id = %execution_id, node_id = %node_id, "Node not activated, skipping");
                ctx.state
                    .add_warning(format!("node '{node_id}' skipped: no active incoming edge"))
                    .await?;
                continue;
            }

            let node = self
                .graph
                .node(node_id)
                .ok_or_else(|| StrataError::GraphValidation(format!("unknown node '{node_id}'")))?;
            let tool = deps
                .tools
                .get(&node.tool)
                .ok_or_else(|| StrataError::ToolNotFound(node.tool.clone()))?;

            let step = ctx.state.next_step().await?;
            ctx.state.set_current_node(node_id).await?;
            deps.checkpoint(ctx, CheckpointKind::NodeStart, Some(node_id)).await?;
            deps.emit(
                ctx,
                "node",
                ProgressSubtype::Start,
                step,
                json!({ "nodeId": node_id, "tool": tool.name() }),
            )
            .await;

            info!(execution_id = %execution_id, node_id = %node_id, tool = %tool.name(), step, "Executing graph node");
            let started = Instant::now();
            let result = deps
                .invoke_tool(ctx, &tool, Some(node_id), node.config.clone())
                .await?;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            // The call was not interrupted; its result is discarded once cancelled
            if ctx.is_cancelled() {
                info!(execution_id = %execution_id, node_id = %node_id, "Cancellation observed after tool call");
                return Ok(RunOutcome::cancelled());
            }

            match result {
                Ok(output) => {
                    let outcome = if tool.conditional() {
                        Some(output.outcome.clone().unwrap_or_else(|| FAILED_BRANCH.to_string()))
                    } else {
                        output.outcome.clone()
                    };
                    ctx.state.merge_data(node_id, &output.data).await?;
                    ctx.state
                        .record_outcome(
                            node_id,
                            &NodeOutcome {
                                node_id: node_id.clone(),
                                tool: tool.name().to_string(),
                                class: tool.class(),
                                succeeded: true,
                                outcome: outcome.clone(),
                                step,
                                elapsed_ms,
                            },
                        )
                        .await?;
                    deps.degradation.record_success();
                    deps.checkpoint(ctx, CheckpointKind::NodeEnd, Some(node_id)).await?;
                    deps.emit(
                        ctx,
                        "node",
                        ProgressSubtype::End,
                        step,
                        json!({
                            "nodeId": node_id,
                            "tool": tool.name(),
                            "elapsedMs": elapsed_ms,
                            "outcome": outcome,
                        }),
                    )
                    .await;
                    debug!(execution_id = %execution_id, node_id = %node_id, elapsed_ms, "Node execution complete");
                }
                Err(e) => {
                    ctx.state
                        .record_outcome(
                            node_id,
                            &NodeOutcome {
                                node_id: node_id.clone(),
                                tool: tool.name().to_string(),
                                class: tool.class(),
                                succeeded: false,
                                outcome: tool.conditional().then(|| FAILED_BRANCH.to_string()),
                                step,
                                elapsed_ms,
                            },
                        )
                        .await?;
                    deps.record_failure(ctx, step, Some(node_id), Some(tool.name()), &e, critical)
                        .await?;
                    if critical {
                        return Ok(RunOutcome::failed(format!(
                            "critical node '{node_id}' failed: {e}"
                        )));
                    }
                }
            }

            // Branch on the outcome as recorded, never on a fresh evaluation
            let recorded = ctx
                .state
                .outcome(node_id)
                .await?
                .and_then(|o| o.outcome);
            for edge in self.graph.outgoing(node_id) {
                match &edge.branch {
                    None => {
                        active.insert(edge.target.as_str());
                    }
                    Some(label) if recorded.as_deref() == Some(label.as_str()) => {
                        debug!(execution_id = %execution_id, from = %node_id, to = %edge.target, branch = %label, "Branch taken");
                        active.insert(edge.target.as_str());
                    }
                    Some(_) => {}
                }
            }
        }

        let data = ctx.state.data().await?;
        let result = serde_json::Value::Object(data.into_iter().collect());
        Ok(RunOutcome::completed(result))
    }
}

impl GraphExecutor for DeclaredGraphExecutor {
    fn condition(&self) -> Condition {
        Condition::Declared
    }

    fn run<'a>(&'a self, ctx: &'a RunContext) -> BoxFuture<'a, Result<RunOutcome>> {
        Box::pin(async move {
            let outcome = self.execute(ctx).await;
            if let Err(e) = &outcome {
                warn!(execution_id = %ctx.state.execution_id(), error = %e, "Declared graph aborted");
            }
            outcome
        })
    }
}
