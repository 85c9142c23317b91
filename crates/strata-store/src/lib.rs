pub mod buffer;
pub mod checkpoint;
pub mod state;

pub use buffer::CheckpointBuffer;
pub use checkpoint::SqliteCheckpointStore;
pub use state::MemoryStateStore;
