use futures::future::BoxFuture;

use strata_core::error::Result;
use strata_core::traits::Tool;
use strata_core::types::{OperationClass, PositionConstraint, ToolInput, ToolOutput};

// ── ShowResultsTool ─────────────────────────────────────────────

/// Terminal tool: collects the presentable parts of working data.
pub struct ShowResultsTool;

const PRESENTABLE: &[&str] = &["summary", "profile", "branch", "record_count"];

impl Tool for ShowResultsTool {
    fn name(&self) -> &str {
        "show_results"
    }
    fn description(&self) -> &str {
        "Assemble the final result from working data."
    }
    fn class(&self) -> OperationClass {
        OperationClass::Output
    }
    fn position(&self) -> PositionConstraint {
        PositionConstraint::MustBeLast
    }
    fn timeout_secs(&self) -> u64 {
        10
    }
    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let mut results = serde_json::Map::new();
            for key in PRESENTABLE {
                if let Some(value) = input.data.get(*key) {
                    results.insert((*key).to_string(), value.clone());
                }
            }
            let usable = results.contains_key("summary") || results.contains_key("profile");
            Ok(ToolOutput::ok(serde_json::json!({
                "results": results,
                "usable": usable,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use strata_core::types::{ExecutionId, SessionId};

    use super::*;

    #[tokio::test]
    async fn test_collects_presentable_fields() {
        let mut data = BTreeMap::new();
        data.insert("summary".to_string(), serde_json::json!("ok"));
        data.insert("records".to_string(), serde_json::json!([1, 2, 3]));
        let out = ShowResultsTool
            .invoke(ToolInput {
                execution_id: ExecutionId::new(),
                session_id: SessionId::new(),
                node_id: Some("show".into()),
                config: serde_json::Value::Null,
                payload: serde_json::Value::Null,
                data,
            })
            .await
            .unwrap();
        assert_eq!(out.data["results"], serde_json::json!({ "summary": "ok" }));
        assert_eq!(out.data["usable"], true);
    }
}
