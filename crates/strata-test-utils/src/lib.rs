//! Mocks and fixtures shared by Strata's test suites.

pub mod decision;
pub mod fixtures;
pub mod mock_tool;
pub mod sink;
pub mod stores;

pub use decision::ScriptedDecisionSource;
pub use fixtures::*;
pub use mock_tool::{MockBehavior, MockTool};
pub use sink::RecordingProgressSink;
pub use stores::{FailingCheckpointStore, FailingStateStore};
