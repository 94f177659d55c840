pub mod admission;
mod cache;
mod dispatch;
pub mod handle;
pub mod hasher;
pub mod metrics;
pub mod queue;
mod request;
pub mod runtime;
mod service;

pub use admission::admit;
pub use cache::{CacheStats, EmbeddingCache};
pub use dispatch::DispatchLoop;
pub use handle::DispatchHandle;
pub use hasher::ChunkHasher;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use queue::{dispatch_order, PriorityQueue};
pub use request::{RequestHandle, RequestOutcome, TaskSnapshot};
pub use runtime::{BatchCapacity, InferenceRuntime, MockRuntime};
pub use service::ChunkScheduler;
