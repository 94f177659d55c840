use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::types::Chunk;

/// Per-cycle batch budget reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BatchCapacity {
    pub max_chunks: usize,
    pub max_tokens: usize,
    /// Distinct requests allowed in one batch.
    pub max_sequences: usize,
}

impl BatchCapacity {
    pub fn chunks(max_chunks: usize) -> Self {
        Self {
            max_chunks,
            max_tokens: usize::MAX,
            max_sequences: usize::MAX,
        }
    }
}

impl Default for BatchCapacity {
    fn default() -> Self {
        Self {
            max_chunks: 8,
            max_tokens: 1024,
            max_sequences: 6,
        }
    }
}

/// The inference backend that turns one chunk into an embedding.
#[async_trait]
pub trait InferenceRuntime: Send + Sync + 'static {
    fn name(&self) -> &str {
        "runtime"
    }

    /// Queried once per dispatch cycle.
    fn capacity(&self) -> BatchCapacity;

    async fn compute(&self, chunk: &Chunk) -> anyhow::Result<Vec<f32>>;
}

type FailPredicate = Box<dyn Fn(&Chunk) -> bool + Send + Sync>;

/// Deterministic runtime for tests and simulation: the embedding is derived
/// from a hash of the chunk content.
pub struct MockRuntime {
    dimensions: usize,
    latency: Duration,
    capacity: Mutex<BatchCapacity>,
    fail_when: Option<FailPredicate>,
    calls: AtomicU64,
}

impl MockRuntime {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            latency: Duration::ZERO,
            capacity: Mutex::new(BatchCapacity::default()),
            fail_when: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_capacity(self, capacity: BatchCapacity) -> Self {
        self.set_capacity(capacity);
        self
    }

    pub fn with_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Chunk) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    pub fn set_capacity(&self, capacity: BatchCapacity) {
        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner) = capacity;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn embed_content(&self, chunk: &Chunk) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        match chunk {
            Chunk::Text { tokens } => tokens.iter().for_each(|t| {
                hasher.update(&t.to_le_bytes());
            }),
            Chunk::Image { pixels, .. } => {
                hasher.update(pixels);
            }
            Chunk::Audio { samples, .. } => samples.iter().for_each(|s| {
                hasher.update(&s.to_le_bytes());
            }),
        }
        let hash = hasher.finalize();
        let bytes = hash.as_bytes();
        (0..self.dimensions)
            .map(|i| bytes[i % 32] as f32 / 255.0)
            .collect()
    }
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn capacity(&self) -> BatchCapacity {
        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn compute(&self, chunk: &Chunk) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(fail) = &self.fail_when {
            if fail(chunk) {
                anyhow::bail!("mock runtime rejected {} chunk", chunk.kind());
            }
        }
        Ok(self.embed_content(chunk))
    }
}
