use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{OperationClass, PositionConstraint, ToolInput, ToolOutput};

// ── LoadInputTool ───────────────────────────────────────────────

/// Entry tool: pulls numeric records out of the execution's input payload.
///
/// Accepts either a bare array or an object with a `values` array
/// (the key can be overridden with `{"field": "..."}` in node config).
pub struct LoadInputTool;

impl Tool for LoadInputTool {
    fn name(&self) -> &str {
        "load_input"
    }
    fn description(&self) -> &str {
        "Load numeric records from the execution input payload."
    }
    fn class(&self) -> OperationClass {
        OperationClass::Data
    }
    fn position(&self) -> PositionConstraint {
        PositionConstraint::MustBeFirst
    }
    fn timeout_secs(&self) -> u64 {
        10
    }
    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let field = input
                .config
                .get("field")
                .and_then(|f| f.as_str())
                .unwrap_or("values");

            let raw = match &input.payload {
                serde_json::Value::Array(items) => items,
                serde_json::Value::Object(map) => match map.get(field) {
                    Some(serde_json::Value::Array(items)) => items,
                    Some(_) => {
                        return Err(StrataError::ToolExecution {
                            tool: self.name().to_string(),
                            message: format!("input field '{field}' is not a list"),
                        })
                    }
                    None => return Ok(ToolOutput::failure(format!("input has no '{field}' field"))),
                },
                _ => return Ok(ToolOutput::failure("input payload is empty")),
            };

            let records: Vec<f64> = raw.iter().filter_map(|v| v.as_f64()).collect();
            if records.is_empty() {
                return Ok(ToolOutput::failure("input contains no numeric records"));
            }

            let skipped = raw.len() - records.len();
            Ok(ToolOutput::ok(serde_json::json!({
                "records": records,
                "record_count": records.len(),
                "skipped": skipped,
            })))
        })
    }
}
