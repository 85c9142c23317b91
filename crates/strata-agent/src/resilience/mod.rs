pub mod circuit_breaker;
pub mod degradation;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakers};
pub use degradation::{DegradationController, LevelPolicy};
