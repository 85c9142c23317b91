use futures::future::BoxFuture;

use strata_core::error::Result;
use strata_core::traits::Tool;
use strata_core::types::{OperationClass, ToolInput, ToolOutput};

use super::{lookup, records};

// ── SummarizeTool ───────────────────────────────────────────────

/// Deterministic synthesis step: renders a short text summary of whatever
/// analysis is present in working data.
pub struct SummarizeTool;

impl Tool for SummarizeTool {
    fn name(&self) -> &str {
        "summarize"
    }
    fn description(&self) -> &str {
        "Produce a text summary from the profile (or raw records) in working data."
    }
    fn class(&self) -> OperationClass {
        OperationClass::Generation
    }
    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let mut lines = Vec::new();

            if let Some(profile) = input.data.get("profile") {
                let num = |key: &str| profile.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
                lines.push(format!(
                    "{} records, mean {:.2} (min {:.2}, max {:.2})",
                    num("count") as u64,
                    num("mean"),
                    num("min"),
                    num("max")
                ));
            } else if let Some(records) = records(&input.data) {
                lines.push(format!("{} records, not profiled", records.len()));
            } else {
                return Ok(ToolOutput::failure("nothing to summarize"));
            }

            if let Some(outcome) = lookup(&input.data, "branch.outcome").and_then(|v| v.as_str()) {
                lines.push(format!("branch condition was {outcome}"));
            }

            Ok(ToolOutput::ok(serde_json::json!({ "summary": lines.join("; ") })))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use strata_core::types::{ExecutionId, SessionId};

    use super::*;

    fn input(data: BTreeMap<String, serde_json::Value>) -> ToolInput {
        ToolInput {
            execution_id: ExecutionId::new(),
            session_id: SessionId::new(),
            node_id: None,
            config: serde_json::Value::Null,
            payload: serde_json::Value::Null,
            data,
        }
    }

    #[tokio::test]
    async fn test_summarizes_profile() {
        let mut data = BTreeMap::new();
        data.insert(
            "profile".into(),
            serde_json::json!({ "count": 3, "mean": 5.0, "min": 2.0, "max": 9.0 }),
        );
        let out = SummarizeTool.invoke(input(data)).await.unwrap();
        assert_eq!(
            out.data["summary"],
            "3 records, mean 5.00 (min 2.00, max 9.00)"
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_records() {
        let mut data = BTreeMap::new();
        data.insert("records".into(), serde_json::json!([1, 2]));
        let out = SummarizeTool.invoke(input(data)).await.unwrap();
        assert_eq!(out.data["summary"], "2 records, not profiled");
    }

    #[tokio::test]
    async fn test_nothing_to_summarize() {
        let out = SummarizeTool.invoke(input(BTreeMap::new())).await.unwrap();
        assert!(!out.success);
    }
}
