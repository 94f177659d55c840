pub mod config;
pub mod lifecycle;
pub mod scheduler;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use config::{BackpressurePolicy, PriorityClasses, SchedulerConfig};
pub use scheduler::{ChunkScheduler, RequestHandle, RequestOutcome};
pub use types::error::{Result, SchedulerError, TaskError};
