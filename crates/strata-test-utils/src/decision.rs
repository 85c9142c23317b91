use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::DecisionSource;
use strata_core::types::{AgentDecision, DecisionRequest};

#[derive(Debug, Clone)]
enum Script {
    AlwaysFinish,
    /// Always pick this tool, never finish.
    Repeat(String),
    /// Play the list, then finish.
    Sequence(Vec<AgentDecision>),
    AlwaysFail,
}

/// Decision source with canned answers; counts how often it was asked.
pub struct ScriptedDecisionSource {
    script: Script,
    asked: Arc<AtomicUsize>,
}

impl ScriptedDecisionSource {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            asked: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always_finish() -> Self {
        Self::with_script(Script::AlwaysFinish)
    }

    pub fn never_finish(tool: &str) -> Self {
        Self::with_script(Script::Repeat(tool.to_string()))
    }

    pub fn sequence(decisions: Vec<AgentDecision>) -> Self {
        Self::with_script(Script::Sequence(decisions))
    }

    pub fn always_fail() -> Self {
        Self::with_script(Script::AlwaysFail)
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }

    pub fn ask_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.asked)
    }
}

impl DecisionSource for ScriptedDecisionSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn decide(&self, _request: DecisionRequest) -> BoxFuture<'_, Result<AgentDecision>> {
        let turn = self.asked.fetch_add(1, Ordering::SeqCst);
        let result = match &self.script {
            Script::AlwaysFinish => Ok(AgentDecision::finish("scripted finish")),
            Script::Repeat(tool) => Ok(AgentDecision::new(
                "execute",
                Some(tool.clone()),
                "scripted repeat",
                0.9,
            )),
            Script::Sequence(list) => Ok(list
                .get(turn)
                .cloned()
                .unwrap_or_else(|| AgentDecision::finish("script exhausted"))),
            Script::AlwaysFail => Err(StrataError::DecisionSource("scripted failure".into())),
        };
        Box::pin(async move { result })
    }
}
