pub mod chunk;
pub mod error;
pub mod task;

pub use chunk::{Chunk, ChunkKind};
pub use error::{Result, SchedulerError, TaskError};
pub use task::{ChunkTask, Embedding, Fingerprint, Priority, RequestId, TaskResult, TaskStatus};
