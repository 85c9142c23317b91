use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{OperationClass, PositionConstraint, ToolInput, ToolOutput};

/// What a `MockTool` does when invoked.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return `ToolOutput::ok(data)`.
    Succeed(serde_json::Value),
    /// Return `ToolOutput::failure(message)`.
    Fail(String),
    /// Return `Err(ToolExecution)`.
    Error(String),
    /// Sleep, then succeed with `null`.
    Sleep(Duration),
    /// Succeed with a branch outcome.
    Branch(String),
}

/// Configurable tool that records every invocation.
pub struct MockTool {
    name: String,
    class: OperationClass,
    position: PositionConstraint,
    conditional: bool,
    timeout_secs: u64,
    behavior: Mutex<MockBehavior>,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<ToolInput>>>,
}

impl MockTool {
    pub fn new(name: &str, class: OperationClass) -> Self {
        Self {
            name: name.to_string(),
            class,
            position: PositionConstraint::Any,
            conditional: false,
            timeout_secs: 60,
            behavior: Mutex::new(MockBehavior::Succeed(serde_json::json!({ "tool": name }))),
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn entry(name: &str) -> Self {
        Self::new(name, OperationClass::Data).with_position(PositionConstraint::MustBeFirst)
    }

    pub fn terminal(name: &str) -> Self {
        Self::new(name, OperationClass::Output).with_position(PositionConstraint::MustBeLast)
    }

    pub fn with_position(mut self, position: PositionConstraint) -> Self {
        self.position = position;
        self
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn as_conditional(mut self) -> Self {
        self.conditional = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        if let Ok(mut guard) = self.behavior.lock() {
            *guard = behavior;
        }
    }

    /// Shared invocation counter, usable after the tool moves into a registry.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared log of received inputs.
    pub fn input_log(&self) -> Arc<Mutex<Vec<ToolInput>>> {
        Arc::clone(&self.inputs)
    }
}

impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock tool"
    }

    fn class(&self) -> OperationClass {
        self.class
    }

    fn position(&self) -> PositionConstraint {
        self.position
    }

    fn conditional(&self) -> bool {
        self.conditional
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn invoke(&self, input: ToolInput) -> BoxFuture<'_, Result<ToolOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.inputs.lock() {
            log.push(input);
        }
        let behavior = self
            .behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(MockBehavior::Fail("poisoned".into()));
        let name = self.name.clone();

        Box::pin(async move {
            match behavior {
                MockBehavior::Succeed(data) => Ok(ToolOutput::ok(data)),
                MockBehavior::Fail(message) => Ok(ToolOutput::failure(message)),
                MockBehavior::Error(message) => Err(StrataError::ToolExecution { tool: name, message }),
                MockBehavior::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(ToolOutput::ok(serde_json::Value::Null))
                }
                MockBehavior::Branch(outcome) => {
                    Ok(ToolOutput::ok(serde_json::json!({ "branch": outcome.clone() })).with_outcome(outcome))
                }
            }
        })
    }
}
