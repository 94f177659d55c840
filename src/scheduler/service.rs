use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore, TryAcquireError};

use super::admission;
use super::cache::{CacheStats, EmbeddingCache};
use super::dispatch::DispatchLoop;
use super::handle::DispatchHandle;
use super::hasher::ChunkHasher;
use super::metrics::{MetricsSnapshot, SchedulerMetrics};
use super::queue::PriorityQueue;
use super::request::{RequestHandle, RequestRegistry, RequestState};
use super::runtime::InferenceRuntime;
use crate::config::{BackpressurePolicy, SchedulerConfig};
use crate::lifecycle::{
    ComponentHealth, ComponentRegistry, HealthStatus, ShutdownCoordinator, ShutdownResult,
};
use crate::types::{
    Chunk, ChunkTask, Priority, RequestId, SchedulerError, TaskError, TaskStatus,
};
use crate::Result;

/// State shared by the scheduler front end and its dispatch loops. Queue,
/// cache and request registry each guard themselves.
pub(crate) struct SchedulerCore {
    pub(crate) config: SchedulerConfig,
    pub(crate) queue: PriorityQueue,
    pub(crate) cache: Arc<EmbeddingCache>,
    pub(crate) requests: RequestRegistry,
    pub(crate) runtime: Arc<dyn InferenceRuntime>,
    pub(crate) metrics: Arc<SchedulerMetrics>,
    permits: Semaphore,
    shutdown: watch::Sender<bool>,
}

impl SchedulerCore {
    /// Bookkeeping after a task reached COMPLETED or FAILED. Must be called
    /// exactly once per runnable task, by whoever won its final transition.
    pub(crate) fn on_task_resolved(&self, task: &ChunkTask, request: Option<&RequestState>) {
        self.permits.add_permits(1);
        self.metrics.dec_in_flight(1);

        match task.result() {
            Some(Ok(_)) => self.metrics.inc_completed(1),
            Some(Err(e)) => {
                self.metrics.inc_failed(1);
                if e.is_cancelled() {
                    self.metrics.inc_cancelled(1);
                }
            }
            None => {}
        }

        let owned;
        let request = match request {
            Some(r) => Some(r),
            None => {
                owned = self.requests.get(task.request_id());
                owned.as_deref()
            }
        };
        if let Some(state) = request {
            if state.task_resolved() {
                // unregister first: a woken consumer may resubmit the same id
                self.requests.remove(state);
                state.publish();
            }
        }
    }

    /// Claims a still-queued task and fails it with `error`.
    fn fail_waiting(&self, task: &ChunkTask, request: Option<&RequestState>, error: TaskError) -> bool {
        if task.claim() && task.resolve(Err(error)) {
            self.on_task_resolved(task, request);
            true
        } else {
            false
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Engine-scoped scheduler: admission, priority queue, embedding cache and
/// dispatch loops for one inference runtime.
pub struct ChunkScheduler {
    core: Arc<SchedulerCore>,
    hasher: ChunkHasher,
    components: Arc<ComponentRegistry>,
}

impl ChunkScheduler {
    /// Builds the scheduler and spawns `config.dispatchers` dispatch loops on
    /// the current tokio runtime.
    pub async fn start(config: SchedulerConfig, runtime: Arc<dyn InferenceRuntime>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let dispatchers = config.dispatchers.max(1);
        let budget = config.max_inflight_tasks.min(Semaphore::MAX_PERMITS);

        tracing::info!(
            runtime = runtime.name(),
            dispatchers,
            cache_capacity = config.cache_capacity,
            max_inflight_tasks = budget,
            backpressure = %config.backpressure,
            "Starting chunk scheduler"
        );

        let core = Arc::new(SchedulerCore {
            queue: PriorityQueue::new(),
            cache: Arc::new(EmbeddingCache::with_budget(
                config.cache_capacity,
                config.cache_max_bytes,
            )),
            requests: RequestRegistry::default(),
            runtime,
            metrics: Arc::new(SchedulerMetrics::new()),
            permits: Semaphore::new(budget),
            shutdown,
            config,
        });

        let components = Arc::new(ComponentRegistry::new());
        for id in 0..dispatchers {
            let worker = DispatchLoop::new(id, Arc::clone(&core), core.shutdown.subscribe());
            let handle = tokio::spawn(worker.run());
            components
                .register(Arc::new(DispatchHandle::new(
                    format!("dispatch_loop_{}", id),
                    handle,
                    Arc::clone(&core.metrics),
                    core.config.degraded_queue_depth,
                )))
                .await;
        }

        Self {
            hasher: ChunkHasher::new(core.config.hash_namespace.clone()),
            core,
            components,
        }
    }

    pub fn hasher(&self) -> &ChunkHasher {
        &self.hasher
    }

    /// Batch admission with this scheduler's hasher. Touches neither queue
    /// nor cache.
    pub fn admit(
        &self,
        request_id: RequestId,
        chunks: Option<&[Chunk]>,
        priority: Priority,
    ) -> Vec<Arc<ChunkTask>> {
        admission::admit(&self.hasher, request_id, chunks, priority)
    }

    /// Queues an admitted request. Tasks that already failed at admission
    /// are accounted as resolved; the rest move PENDING -> WAIT.
    pub async fn submit(
        &self,
        request_id: RequestId,
        tasks: Vec<Arc<ChunkTask>>,
    ) -> Result<RequestHandle> {
        if self.core.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        validate_submission(request_id, &tasks)?;

        if tasks.is_empty() {
            return Ok(RequestHandle::ready(request_id));
        }

        let runnable: Vec<Arc<ChunkTask>> = tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Pending)
            .cloned()
            .collect();

        self.acquire_permits(runnable.len()).await?;

        let (state, done) = RequestState::new(request_id, tasks.clone(), runnable.len());
        if let Err(e) = self.core.requests.insert(Arc::clone(&state)) {
            self.core.permits.add_permits(runnable.len());
            return Err(e);
        }

        self.core.metrics.inc_submitted(tasks.len() as u64);
        self.core.metrics.inc_in_flight(runnable.len());
        self.core.metrics.inc_failed((tasks.len() - runnable.len()) as u64);

        if runnable.is_empty() {
            self.core.requests.remove(&state);
            state.publish();
            return Ok(RequestHandle::new(request_id, tasks, done));
        }

        let mut queued = 0;
        for task in runnable {
            self.core.metrics.inc_queue(1);
            // A concurrent cancel may already have failed it.
            if self.core.queue.push(task).is_ok() {
                queued += 1;
            } else {
                self.core.metrics.dec_queue(1);
            }
        }

        tracing::debug!(
            request_id,
            chunks = tasks.len(),
            queued,
            queue_depth = self.core.queue.len(),
            "Request submitted"
        );

        Ok(RequestHandle::new(request_id, tasks, done))
    }

    /// Admission followed by submission.
    pub async fn enqueue(
        &self,
        request_id: RequestId,
        chunks: Option<&[Chunk]>,
        priority: Priority,
    ) -> Result<RequestHandle> {
        let tasks = self.admit(request_id, chunks, priority);
        self.submit(request_id, tasks).await
    }

    /// Like [`enqueue`](Self::enqueue) with the priority looked up by task label.
    pub async fn enqueue_labeled(
        &self,
        request_id: RequestId,
        chunks: Option<&[Chunk]>,
        label: &str,
    ) -> Result<RequestHandle> {
        let priority = self.core.config.priority_classes.priority_of(label);
        self.enqueue(request_id, chunks, priority).await
    }

    async fn acquire_permits(&self, needed: usize) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }
        let budget = self.core.config.max_inflight_tasks;
        if needed > budget {
            return Err(SchedulerError::RequestTooLarge { needed, budget });
        }
        let n = u32::try_from(needed).map_err(|_| SchedulerError::RequestTooLarge {
            needed,
            budget,
        })?;

        match self.core.config.backpressure {
            BackpressurePolicy::Reject => match self.core.permits.try_acquire_many(n) {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    tracing::debug!(needed, "Admission rejected by backpressure");
                    return Err(SchedulerError::Backpressure {
                        in_flight: self.core.metrics.get_in_flight(),
                        budget,
                    });
                }
                Err(TryAcquireError::Closed) => return Err(SchedulerError::ShuttingDown),
            },
            BackpressurePolicy::Block => {
                let permit = self
                    .core
                    .permits
                    .acquire_many(n)
                    .await
                    .map_err(|_| SchedulerError::ShuttingDown)?;
                permit.forget();
            }
        }
        Ok(())
    }

    /// Withdraws a request. Queued and not-yet-queued tasks fail with
    /// `Cancelled` right away; tasks already in flight resolve as cancelled
    /// without interrupting a computation other requests share. Returns
    /// false if the request is unknown, finished, or already cancelled.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let Some(state) = self.core.requests.get(request_id) else {
            return false;
        };
        if !state.cancel() {
            return false;
        }

        let removed = self.core.queue.remove_request(request_id);
        self.core.metrics.dec_queue(removed.len());

        let mut withdrawn = 0;
        for task in state.tasks() {
            let failed = match task.status() {
                TaskStatus::Pending => {
                    if task.fail_pending(TaskError::Cancelled) {
                        self.core.on_task_resolved(task, Some(&state));
                        true
                    } else {
                        false
                    }
                }
                TaskStatus::Wait => {
                    self.core
                        .fail_waiting(task, Some(&state), TaskError::Cancelled)
                }
                _ => false,
            };
            if failed {
                withdrawn += 1;
            }
        }

        tracing::info!(request_id, withdrawn, "Request cancelled");
        true
    }

    pub fn queue_depth(&self) -> usize {
        self.core.queue.len()
    }

    pub fn active_requests(&self) -> usize {
        self.core.requests.len()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.core.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    pub async fn health(&self) -> Vec<ComponentHealth> {
        self.components.health().await
    }

    /// Worst health across the dispatch loops.
    pub async fn overall_health(&self) -> HealthStatus {
        self.components.overall_health().await
    }

    /// Stops admission, lets the dispatch loops drain the queue within
    /// `timeout`, then fails whatever is left with `ShuttingDown`.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<(String, ShutdownResult)> {
        tracing::info!(
            queue_depth = self.core.queue.len(),
            active_requests = self.core.requests.len(),
            "Initiating scheduler shutdown"
        );
        self.core.shutdown.send_replace(true);
        self.core.permits.close();
        self.core.queue.wake_all();

        let results = ShutdownCoordinator::new(Arc::clone(&self.components))
            .shutdown(timeout)
            .await;

        let mut abandoned = 0;
        for task in self.core.queue.drain() {
            let request = self.core.requests.get(task.request_id());
            if self
                .core
                .fail_waiting(&task, request.as_deref(), TaskError::ShuttingDown)
            {
                abandoned += 1;
            }
        }
        // Loops are stopped; nothing else will resolve these.
        for state in self.core.requests.all() {
            for task in state.tasks() {
                let resolved = match task.status() {
                    TaskStatus::Pending => task.fail_pending(TaskError::ShuttingDown),
                    TaskStatus::Wait => task.claim() && task.resolve(Err(TaskError::ShuttingDown)),
                    TaskStatus::InProgress => task.resolve(Err(TaskError::ShuttingDown)),
                    _ => false,
                };
                if resolved {
                    abandoned += 1;
                    self.core.on_task_resolved(task, Some(&state));
                }
            }
        }
        self.core.metrics.dec_queue(self.core.metrics.get_queue_depth());

        if abandoned > 0 {
            tracing::warn!(abandoned, "Tasks failed at shutdown");
        }
        results
    }
}

fn validate_submission(request_id: RequestId, tasks: &[Arc<ChunkTask>]) -> Result<()> {
    let last = tasks.len().saturating_sub(1);
    for (i, task) in tasks.iter().enumerate() {
        if task.request_id() != request_id {
            return Err(SchedulerError::InvalidSubmission(format!(
                "task {} belongs to request {}, not {}",
                i,
                task.request_id(),
                request_id
            )));
        }
        if task.position() != i {
            return Err(SchedulerError::InvalidSubmission(format!(
                "task at index {} has position {}",
                i,
                task.position()
            )));
        }
        if task.is_terminal() != (i == last) {
            return Err(SchedulerError::InvalidSubmission(format!(
                "terminal flag misplaced at position {}",
                i
            )));
        }
        if !matches!(task.status(), TaskStatus::Pending | TaskStatus::Failed) {
            return Err(SchedulerError::InvalidSubmission(format!(
                "task {} was already submitted (status {})",
                i,
                task.status()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
impl SchedulerCore {
    pub(crate) fn for_tests(runtime: Arc<dyn InferenceRuntime>) -> Self {
        let config = SchedulerConfig::default();
        let (shutdown, _) = watch::channel(false);
        Self {
            queue: PriorityQueue::new(),
            cache: Arc::new(EmbeddingCache::new(config.cache_capacity)),
            requests: RequestRegistry::default(),
            runtime,
            metrics: Arc::new(SchedulerMetrics::new()),
            permits: Semaphore::new(config.max_inflight_tasks),
            shutdown,
            config,
        }
    }
}
