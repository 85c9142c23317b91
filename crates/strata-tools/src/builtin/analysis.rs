use futures::future::BoxFuture;
use serde::Deserialize;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{OperationClass, ToolInput, ToolOutput};

use super::{lookup, records};

// ── ProfileDataTool ─────────────────────────────────────────────

pub struct ProfileDataTool;

impl Tool for ProfileDataTool {
    fn name(&self) -> &str {
        "profile_data"
    }
    fn description(&self) -> &str {
        "Compute count, sum, mean, min and max over loaded records."
    }
    fn class(&self) -> OperationClass {
        OperationClass::Analysis
    }
    fn timeout_secs(&self) -> u64 {
        30
    }
    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let records = match records(&input.data) {
                Some(r) if !r.is_empty() => r,
                _ => return Ok(ToolOutput::failure("no records to profile")),
            };

            let count = records.len();
            let sum: f64 = records.iter().sum();
            let min = records.iter().copied().fold(f64::INFINITY, f64::min);
            let max = records.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            Ok(ToolOutput::ok(serde_json::json!({
                "profile": {
                    "count": count,
                    "sum": sum,
                    "mean": sum / count as f64,
                    "min": min,
                    "max": max,
                }
            })))
        })
    }
}

// ── BranchOnTool ────────────────────────────────────────────────

/// Two-outcome conditional: compares a working-data value to a threshold
/// and reports `"true"` or `"false"` as its outcome.
pub struct BranchOnTool;

#[derive(Deserialize)]
struct BranchConfig {
    path: String,
    threshold: f64,
    #[serde(default = "default_op")]
    op: String,
}

fn default_op() -> String {
    "gt".to_string()
}

impl Tool for BranchOnTool {
    fn name(&self) -> &str {
        "branch_on"
    }
    fn description(&self) -> &str {
        "Branch on a numeric working-data value (config: path, threshold, op = gt|gte|lt|lte)."
    }
    fn class(&self) -> OperationClass {
        OperationClass::Analysis
    }
    fn conditional(&self) -> bool {
        true
    }
    fn timeout_secs(&self) -> u64 {
        5
    }
    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let config: BranchConfig =
                serde_json::from_value(input.config.clone()).map_err(|e| {
                    StrataError::ToolExecution {
                        tool: self.name().to_string(),
                        message: format!("invalid config: {e}"),
                    }
                })?;

            let value = match lookup(&input.data, &config.path).and_then(|v| v.as_f64()) {
                Some(v) => v,
                None => {
                    return Ok(ToolOutput::failure(format!(
                        "no numeric value at '{}'",
                        config.path
                    )))
                }
            };

            let taken = match config.op.as_str() {
                "gt" => value > config.threshold,
                "gte" => value >= config.threshold,
                "lt" => value < config.threshold,
                "lte" => value <= config.threshold,
                other => {
                    return Err(StrataError::ToolExecution {
                        tool: self.name().to_string(),
                        message: format!("unknown comparison '{other}'"),
                    })
                }
            };
            let outcome = if taken { "true" } else { "false" };

            Ok(ToolOutput::ok(serde_json::json!({
                "branch": {
                    "path": config.path,
                    "value": value,
                    "threshold": config.threshold,
                    "outcome": outcome,
                }
            }))
            .with_outcome(outcome))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use strata_core::types::{ExecutionId, SessionId};

    use super::*;

    fn input(config: serde_json::Value, data: serde_json::Value) -> ToolInput {
        let data = match data {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        ToolInput {
            execution_id: ExecutionId::new(),
            session_id: SessionId::new(),
            node_id: None,
            config,
            payload: serde_json::Value::Null,
            data,
        }
    }

    #[tokio::test]
    async fn test_profile() {
        let out = ProfileDataTool
            .invoke(input(
                serde_json::Value::Null,
                serde_json::json!({ "records": [2.0, 4.0, 9.0] }),
            ))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.data["profile"]["mean"], 5.0);
        assert_eq!(out.data["profile"]["min"], 2.0);
        assert_eq!(out.data["profile"]["max"], 9.0);
    }

    #[tokio::test]
    async fn test_profile_without_records_fails() {
        let out = ProfileDataTool
            .invoke(input(serde_json::Value::Null, serde_json::json!({})))
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_branch_outcomes() {
        let data = serde_json::json!({ "profile": { "mean": 5.0 } });
        let high = BranchOnTool
            .invoke(input(
                serde_json::json!({ "path": "profile.mean", "threshold": 3.0 }),
                data.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(high.outcome.as_deref(), Some("true"));

        let low = BranchOnTool
            .invoke(input(
                serde_json::json!({ "path": "profile.mean", "threshold": 5.0, "op": "lt" }),
                data,
            ))
            .await
            .unwrap();
        assert_eq!(low.outcome.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_branch_missing_value_fails() {
        let out = BranchOnTool
            .invoke(input(
                serde_json::json!({ "path": "profile.mean", "threshold": 1.0 }),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.outcome.is_none());
    }

    #[tokio::test]
    async fn test_branch_bad_config_is_error() {
        let err = BranchOnTool
            .invoke(input(serde_json::json!({}), serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ToolExecution { .. }));
    }
}
