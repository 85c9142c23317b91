pub mod autonomous;
pub mod decision;
pub mod executor;
pub mod graph;
pub mod progress;
pub mod resilience;
pub mod service;
pub mod state;

pub use autonomous::AutonomousLoopExecutor;
pub use decision::{fallback_decision, HeuristicDecisionSource, HttpDecisionSource};
pub use executor::{ExecutorDeps, GraphExecutor, RunContext, RunOutcome};
pub use graph::{validate, DeclaredGraphExecutor, ValidatedGraph};
pub use progress::ProgressEmitter;
pub use resilience::{CircuitBreaker, CircuitBreakers, DegradationController, LevelPolicy};
pub use service::{
    ExecutionStatusReport, HealthReport, OrchestrationService, StartRequest, StartResponse,
};
pub use state::StateHandle;
