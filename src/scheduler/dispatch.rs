use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::instrument;

use super::request::RequestState;
use super::service::SchedulerCore;
use crate::types::{ChunkTask, Embedding, RequestId, TaskError, TaskResult, TaskStatus};

struct Selected {
    task: Arc<ChunkTask>,
    request: Option<Arc<RequestState>>,
}

#[derive(Default)]
struct FormedBatch {
    selected: Vec<Selected>,
    deferred: usize,
}

/// Pops ready tasks in queue order into one batch bounded by the runtime's
/// current capacity. A task is put back while an earlier chunk of its request
/// is still unresolved outside this batch.
fn form_batch(core: &SchedulerCore) -> FormedBatch {
    let capacity = core.runtime.capacity();
    let max_chunks = capacity.max_chunks.max(1);
    let max_sequences = capacity.max_sequences.max(1);

    let mut batch = FormedBatch::default();
    let mut putback: Vec<Arc<ChunkTask>> = Vec::new();
    let mut tokens = 0usize;
    let mut sequences: HashSet<RequestId> = HashSet::new();
    let mut selected_keys: HashSet<(RequestId, usize)> = HashSet::new();

    while batch.selected.len() < max_chunks {
        let Some(task) = core.queue.pop() else {
            break;
        };
        core.metrics.dec_queue(1);

        if task.status() != TaskStatus::Wait {
            // withdrawn after it was queued
            continue;
        }

        let request = core.requests.get(task.request_id());
        if let Some(state) = &request {
            let request_id = task.request_id();
            if !state.predecessors_settled(task.position(), |p| {
                selected_keys.contains(&(request_id, p))
            }) {
                tracing::trace!(
                    request_id,
                    position = task.position(),
                    "Deferring chunk until its predecessors resolve"
                );
                batch.deferred += 1;
                putback.push(task);
                continue;
            }
        }

        let task_tokens = task.chunk().n_tokens();
        let new_sequence = !sequences.contains(&task.request_id());
        let over_tokens = tokens.saturating_add(task_tokens) > capacity.max_tokens;
        let over_sequences = new_sequence && sequences.len() >= max_sequences;
        if !batch.selected.is_empty() && (over_tokens || over_sequences) {
            putback.push(task);
            break;
        }

        if !task.claim() {
            continue;
        }
        tokens = tokens.saturating_add(task_tokens);
        sequences.insert(task.request_id());
        selected_keys.insert((task.request_id(), task.position()));
        batch.selected.push(Selected { task, request });
    }

    let returned = putback
        .into_iter()
        .filter(|t| core.queue.requeue(t.clone()))
        .count();
    core.metrics.inc_queue(returned);
    core.metrics.inc_deferred(batch.deferred as u64);

    batch
}

/// Splits a batch into per-request sequences, each in chunk order. Requests
/// keep the order in which the batch first reached them.
fn by_request(selected: Vec<Selected>) -> Vec<Vec<Selected>> {
    let mut sequences: Vec<Vec<Selected>> = Vec::new();
    for s in selected {
        let request_id = s.task.request_id();
        match sequences
            .iter_mut()
            .find(|seq| seq[0].task.request_id() == request_id)
        {
            Some(seq) => seq.push(s),
            None => sequences.push(vec![s]),
        }
    }
    for seq in &mut sequences {
        seq.sort_by_key(|s| s.task.position());
    }
    sequences
}

async fn compute_embedding(core: &SchedulerCore, task: &Arc<ChunkTask>) -> TaskResult {
    let runtime = Arc::clone(&core.runtime);
    let owned = Arc::clone(task);
    let compute = move || async move { runtime.compute(owned.chunk()).await };

    match task.fingerprint() {
        Some(fp) => core.cache.resolve(fp, compute).await,
        None => compute()
            .await
            .map(Embedding::from)
            .map_err(|e| TaskError::Compute(e.to_string())),
    }
}

async fn resolve_task(core: &SchedulerCore, task: &Arc<ChunkTask>, request: Option<&RequestState>) {
    let result = match request {
        Some(state) if state.is_cancelled() => Err(TaskError::Cancelled),
        Some(state) => {
            tokio::select! {
                r = compute_embedding(core, task) => r,
                _ = state.cancelled() => Err(TaskError::Cancelled),
            }
        }
        None => compute_embedding(core, task).await,
    };

    if let Err(e) = &result {
        tracing::debug!(
            request_id = task.request_id(),
            position = task.position(),
            error = %e,
            "Chunk failed"
        );
    }

    if task.resolve(result) {
        if task.is_terminal() {
            tracing::debug!(request_id = task.request_id(), status = %task.status(), "Terminal chunk resolved");
        }
        core.on_task_resolved(task, request);
    }
}

pub struct DispatchLoop {
    id: usize,
    core: Arc<SchedulerCore>,
    shutdown: watch::Receiver<bool>,
}

impl DispatchLoop {
    pub(crate) fn new(id: usize, core: Arc<SchedulerCore>, shutdown: watch::Receiver<bool>) -> Self {
        Self { id, core, shutdown }
    }

    /// Runs until shutdown is requested and the queue is drained. Returns the
    /// number of tasks this loop resolved.
    pub async fn run(mut self) -> usize {
        let mut processed_count = 0;

        loop {
            let batch = form_batch(&self.core);

            if !batch.selected.is_empty() {
                processed_count += self.dispatch(batch.selected).await;
                continue;
            }

            if *self.shutdown.borrow() && self.core.queue.is_empty() {
                break;
            }

            if batch.deferred > 0 {
                tokio::time::sleep(self.core.config.defer_backoff).await;
                continue;
            }

            let notified = self.core.queue.notified();
            if !self.core.queue.is_empty() {
                continue;
            }
            tokio::select! {
                _ = notified => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(loop_id = self.id, processed_count, "Dispatch loop shutdown complete");
        processed_count
    }

    #[instrument(skip(self, selected), fields(loop_id = self.id, batch_size = selected.len()))]
    async fn dispatch(&self, selected: Vec<Selected>) -> usize {
        self.core.metrics.inc_batches();
        self.core.metrics.inc_dispatched(selected.len() as u64);

        let tasks: Vec<Arc<ChunkTask>> = selected.iter().map(|s| s.task.clone()).collect();
        let mut jobs = JoinSet::new();
        for sequence in by_request(selected) {
            let core = Arc::clone(&self.core);
            // chunk k reaches the runtime only after chunk k-1 resolved
            jobs.spawn(async move {
                for Selected { task, request } in sequence {
                    resolve_task(&core, &task, request.as_deref()).await;
                }
            });
        }

        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(loop_id = self.id, "Chunk resolution job failed: {}", e);
            }
        }

        // A job that died must not leave its task stuck in flight.
        let mut resolved = 0;
        for task in &tasks {
            if task.status() == TaskStatus::InProgress
                && task.resolve(Err(TaskError::ComputeAborted(
                    "resolution job terminated".to_string(),
                )))
            {
                let request = self.core.requests.get(task.request_id());
                self.core.on_task_resolved(task, request.as_deref());
            }
            if task.status().is_terminal() {
                resolved += 1;
            }
        }
        resolved
    }
}
