use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::SchedulerConfig;
use crate::scheduler::{BatchCapacity, ChunkScheduler, InferenceRuntime};
use crate::types::{Chunk, RequestId};

/// Token that identifies a chunk in recorded dispatch order.
pub fn tag(request_id: RequestId, position: usize) -> u32 {
    (request_id * 100 + position as u64) as u32
}

/// Text chunks tagged with their request id and position.
pub fn tagged_chunks(request_id: RequestId, count: usize) -> Vec<Chunk> {
    (0..count)
        .map(|p| Chunk::text(vec![tag(request_id, p)]))
        .collect()
}

/// Runtime that records the order in which chunks reach it and can hold a
/// chosen chunk until released.
pub struct RecordingRuntime {
    log: Mutex<Vec<u32>>,
    calls: AtomicUsize,
    capacity: Mutex<BatchCapacity>,
    held_token: Option<u32>,
    gate: watch::Sender<bool>,
    latency: Duration,
    fail_token: Option<u32>,
}

impl RecordingRuntime {
    pub fn new(capacity: BatchCapacity) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            log: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            capacity: Mutex::new(capacity),
            held_token: None,
            gate,
            latency: Duration::ZERO,
            fail_token: None,
        }
    }

    /// Computation of the chunk carrying `token` blocks until [`release`](Self::release).
    pub fn holding(mut self, token: u32) -> Self {
        self.held_token = Some(token);
        self
    }

    pub fn failing_on(mut self, token: u32) -> Self {
        self.fail_token = Some(token);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_capacity(&self, capacity: BatchCapacity) {
        *self.capacity.lock().unwrap() = capacity;
    }

    pub fn order(&self) -> Vec<u32> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceRuntime for RecordingRuntime {
    fn name(&self) -> &str {
        "recording"
    }

    fn capacity(&self) -> BatchCapacity {
        *self.capacity.lock().unwrap()
    }

    async fn compute(&self, chunk: &Chunk) -> anyhow::Result<Vec<f32>> {
        let token = match chunk {
            Chunk::Text { tokens } => tokens.first().copied().unwrap_or_default(),
            _ => u32::MAX,
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(token);

        if self.held_token == Some(token) {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_token == Some(token) {
            anyhow::bail!("runtime refused chunk {}", token);
        }
        Ok(vec![token as f32; 4])
    }
}

pub struct TestContext {
    pub runtime: Arc<RecordingRuntime>,
    pub scheduler: ChunkScheduler,
}

impl TestContext {
    pub async fn new(runtime: RecordingRuntime, config: SchedulerConfig) -> Self {
        let runtime = Arc::new(runtime);
        let scheduler = ChunkScheduler::start(config, runtime.clone()).await;
        Self { runtime, scheduler }
    }

    /// Waits until the runtime has been called `n` times.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..200 {
            if self.runtime.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("runtime saw {} calls, expected {}", self.runtime.calls(), n);
    }
}
