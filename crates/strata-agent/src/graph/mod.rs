//! Declared graphs: validation and execution of user-authored DAGs.
//!
//! A workflow is a set of tool nodes joined by directed edges. `validate`
//! checks it against the tool registry and fixes a deterministic
//! topological order; `DeclaredGraphExecutor` walks that order, following
//! labeled edges out of conditional nodes by their recorded outcome.

pub mod declared;
pub mod validate;

pub use declared::DeclaredGraphExecutor;
pub use validate::{topological_order, validate, ValidatedGraph};
