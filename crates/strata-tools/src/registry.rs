use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{OperationClass, PositionConstraint, ToolDescriptor, ToolInput, ToolOutput};

/// Registry of available tools, populated once at startup and shared read-only.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already shared tool (a later registration replaces an earlier one).
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!(tool = %name, "Tool replaced in registry");
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors of all tools, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Tools of one class, sorted by name.
    pub fn of_class(&self, class: OperationClass) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tools
            .values()
            .filter(|t| t.class() == class)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Preferred tool for a class: one carrying `position` if any, else the first by name.
    /// Conditional tools are never picked; they need a graph to branch in.
    pub fn preferred(&self, class: OperationClass, position: PositionConstraint) -> Option<Arc<dyn Tool>> {
        let tools: Vec<Arc<dyn Tool>> = self
            .of_class(class)
            .into_iter()
            .filter(|t| !t.conditional())
            .collect();
        tools
            .iter()
            .find(|t| t.position() == position)
            .or_else(|| tools.first())
            .cloned()
    }

    /// Invoke a tool by name under a deadline.
    pub async fn execute(&self, name: &str, input: ToolInput, timeout: Duration) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| StrataError::ToolNotFound(name.to_string()))?;

        match tokio::time::timeout(timeout, tool.invoke(input)).await {
            Ok(result) => result,
            Err(_) => Err(StrataError::ToolTimeout {
                tool: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::data::LoadInputTool);
        registry.register(crate::builtin::analysis::ProfileDataTool);
        registry.register(crate::builtin::analysis::BranchOnTool);
        registry.register(crate::builtin::generation::SummarizeTool);
        registry.register(crate::builtin::output::ShowResultsTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures::future::BoxFuture;
    use strata_core::types::{ExecutionId, SessionId};

    use super::*;

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn class(&self) -> OperationClass {
            OperationClass::Analysis
        }
        fn invoke(&self, _input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ToolOutput::ok(serde_json::Value::Null))
            })
        }
    }

    fn input() -> ToolInput {
        ToolInput {
            execution_id: ExecutionId::new(),
            session_id: SessionId::new(),
            node_id: None,
            config: serde_json::Value::Null,
            payload: serde_json::json!([1, 2, 3]),
            data: BTreeMap::new(),
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(
            registry.list(),
            vec!["branch_on", "load_input", "profile_data", "show_results", "summarize"]
        );
    }

    #[test]
    fn test_preferred_tool_for_class() {
        let registry = ToolRegistry::with_builtins();
        let data = registry
            .preferred(OperationClass::Data, PositionConstraint::MustBeFirst)
            .unwrap();
        assert_eq!(data.name(), "load_input");
        let analysis = registry
            .preferred(OperationClass::Analysis, PositionConstraint::Any)
            .unwrap();
        assert_eq!(analysis.name(), "profile_data");
        assert!(registry
            .preferred(OperationClass::Decision, PositionConstraint::Any)
            .is_none());
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", input(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry
            .execute("slow", input(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_execute_builtin() {
        let registry = ToolRegistry::with_builtins();
        let out = registry
            .execute("load_input", input(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.success);
    }
}
