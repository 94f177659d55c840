use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::types::{
    ChunkKind, ChunkTask, Embedding, RequestId, SchedulerError, TaskError, TaskStatus,
};

/// Request-level signal, published once every task of the request resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// The terminal chunk completed; generation may proceed.
    Ready,
    Failed { reason: String },
    Cancelled,
}

impl RequestOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

pub(crate) struct RequestState {
    id: RequestId,
    tasks: Vec<Arc<ChunkTask>>,
    outstanding: AtomicUsize,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    done: watch::Sender<Option<RequestOutcome>>,
}

impl RequestState {
    pub(crate) fn new(
        id: RequestId,
        tasks: Vec<Arc<ChunkTask>>,
        outstanding: usize,
    ) -> (Arc<Self>, watch::Receiver<Option<RequestOutcome>>) {
        let (done, rx) = watch::channel(None);
        let state = Arc::new(Self {
            id,
            tasks,
            outstanding: AtomicUsize::new(outstanding),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            done,
        });
        (state, rx)
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn tasks(&self) -> &[Arc<ChunkTask>] {
        &self.tasks
    }

    /// True when every chunk before `position` has either resolved or is
    /// part of the batch being formed (`in_batch` by position). Within a
    /// batch a request's chunks run in position order.
    pub(crate) fn predecessors_settled(&self, position: usize, in_batch: impl Fn(usize) -> bool) -> bool {
        self.tasks
            .iter()
            .take(position)
            .all(|t| t.status().is_terminal() || in_batch(t.position()))
    }

    /// Accounts one resolved task. Returns true for the call that finished
    /// the request; that caller must unregister it and then [`publish`](Self::publish).
    pub(crate) fn task_resolved(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn publish(&self) {
        let outcome = self.outcome();
        tracing::debug!(request_id = self.id, outcome = ?outcome, "Request resolved");
        self.done.send_replace(Some(outcome));
    }

    fn outcome(&self) -> RequestOutcome {
        if self.is_cancelled() {
            return RequestOutcome::Cancelled;
        }
        let Some(terminal) = self.tasks.last() else {
            return RequestOutcome::Ready;
        };
        match terminal.result() {
            Some(Ok(_)) => RequestOutcome::Ready,
            Some(Err(e)) => RequestOutcome::Failed {
                reason: e.to_string(),
            },
            None => RequestOutcome::Failed {
                reason: format!("terminal chunk ended in status {}", terminal.status()),
            },
        }
    }

    /// Marks the request withdrawn. Returns false if it already was.
    pub(crate) fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            self.cancel_notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the request is cancelled.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Active requests by id.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    requests: Mutex<HashMap<RequestId, Arc<RequestState>>>,
}

impl RequestRegistry {
    fn requests(&self) -> MutexGuard<'_, HashMap<RequestId, Arc<RequestState>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, state: Arc<RequestState>) -> crate::Result<()> {
        let mut requests = self.requests();
        if requests.contains_key(&state.id) {
            return Err(SchedulerError::DuplicateRequest(state.id));
        }
        requests.insert(state.id, state);
        Ok(())
    }

    pub(crate) fn get(&self, id: RequestId) -> Option<Arc<RequestState>> {
        self.requests().get(&id).cloned()
    }

    /// Removes `state` only if it is still the registered entry for its id.
    pub(crate) fn remove(&self, state: &RequestState) {
        let mut requests = self.requests();
        if requests
            .get(&state.id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), state))
        {
            requests.remove(&state.id);
        }
    }

    pub(crate) fn all(&self) -> Vec<Arc<RequestState>> {
        self.requests().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests().len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub position: usize,
    pub kind: ChunkKind,
    pub status: TaskStatus,
    pub terminal: bool,
    pub fingerprint: Option<String>,
    pub dimensions: Option<usize>,
    pub error: Option<String>,
}

/// Consumer side of one submitted request.
pub struct RequestHandle {
    id: RequestId,
    tasks: Vec<Arc<ChunkTask>>,
    done: watch::Receiver<Option<RequestOutcome>>,
}

impl RequestHandle {
    pub(crate) fn new(
        id: RequestId,
        tasks: Vec<Arc<ChunkTask>>,
        done: watch::Receiver<Option<RequestOutcome>>,
    ) -> Self {
        Self { id, tasks, done }
    }

    /// Handle for a request with nothing to schedule.
    pub(crate) fn ready(id: RequestId) -> Self {
        let (_, done) = watch::channel(Some(RequestOutcome::Ready));
        Self {
            id,
            tasks: Vec::new(),
            done,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn tasks(&self) -> &[Arc<ChunkTask>] {
        &self.tasks
    }

    /// Waits for the request-terminal signal.
    pub async fn wait(&self) -> RequestOutcome {
        let mut done = self.done.clone();
        let published = done
            .wait_for(Option::is_some)
            .await
            .map(|v| (*v).clone())
            .ok()
            .flatten();
        // Sender gone; the value may still have been published.
        let outcome = published.or_else(|| done.borrow().clone());
        outcome.unwrap_or_else(|| RequestOutcome::Failed {
            reason: "scheduler dropped the request".to_string(),
        })
    }

    pub fn try_outcome(&self) -> Option<RequestOutcome> {
        self.done.borrow().clone()
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks.iter().map(|t| t.status()).collect()
    }

    /// Embeddings in chunk order; `None` for tasks that did not complete.
    pub fn embeddings(&self) -> Vec<Option<Embedding>> {
        self.tasks.iter().map(|t| t.embedding()).collect()
    }

    pub fn errors(&self) -> Vec<(usize, TaskError)> {
        self.tasks
            .iter()
            .filter_map(|t| t.error().map(|e| (t.position(), e)))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .map(|t| TaskSnapshot {
                position: t.position(),
                kind: t.chunk().kind(),
                status: t.status(),
                terminal: t.is_terminal(),
                fingerprint: t.fingerprint().map(|f| f.short()),
                dimensions: t.embedding().map(|e| e.len()),
                error: t.error().map(|e| e.to_string()),
            })
            .collect()
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("tasks", &self.tasks.len())
            .field("outcome", &self.try_outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    fn tasks(n: usize) -> Vec<Arc<ChunkTask>> {
        (0..n)
            .map(|i| {
                Arc::new(ChunkTask::new(
                    Chunk::text(vec![i as u32 + 1]),
                    None,
                    1,
                    0,
                    i,
                    i + 1 == n,
                ))
            })
            .collect()
    }

    fn complete(t: &ChunkTask) {
        t.mark_waiting();
        t.claim();
        t.resolve(Ok(Embedding::from(vec![1.0])));
    }

    #[test]
    fn test_predecessors_settled() {
        let ts = tasks(3);
        let (state, _) = RequestState::new(1, ts.clone(), 3);
        let none = |_: usize| false;
        assert!(state.predecessors_settled(0, none));
        assert!(!state.predecessors_settled(1, none));

        // claimed elsewhere but still running
        ts[0].mark_waiting();
        ts[0].claim();
        assert!(!state.predecessors_settled(1, none));
        assert!(state.predecessors_settled(1, |p| p == 0));
        assert!(!state.predecessors_settled(2, |p| p == 0));

        ts[0].resolve(Ok(Embedding::from(vec![1.0])));
        assert!(state.predecessors_settled(1, none));
        assert!(state.predecessors_settled(2, |p| p == 1));
    }

    #[tokio::test]
    async fn test_signal_after_last_resolution() {
        let ts = tasks(2);
        let (state, rx) = RequestState::new(1, ts.clone(), 2);
        let handle = RequestHandle::new(1, ts.clone(), rx);

        complete(&ts[1]);
        assert!(!state.task_resolved());
        assert!(handle.try_outcome().is_none());

        complete(&ts[0]);
        assert!(state.task_resolved());
        assert!(handle.try_outcome().is_none());
        state.publish();
        assert_eq!(handle.wait().await, RequestOutcome::Ready);
    }

    #[tokio::test]
    async fn test_failed_terminal_fails_request() {
        let ts = tasks(1);
        let (state, rx) = RequestState::new(1, ts.clone(), 1);
        let handle = RequestHandle::new(1, ts.clone(), rx);

        ts[0].mark_waiting();
        ts[0].claim();
        ts[0].resolve(Err(TaskError::Compute("oom".into())));
        assert!(state.task_resolved());
        state.publish();

        assert!(matches!(handle.wait().await, RequestOutcome::Failed { .. }));
        assert_eq!(handle.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_ready_handle_does_not_block() {
        let handle = RequestHandle::ready(4);
        assert_eq!(handle.wait().await, RequestOutcome::Ready);
        assert!(handle.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let (state, _) = RequestState::new(1, tasks(1), 1);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(state.cancel());
        assert!(!state.cancel());
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = RequestRegistry::default();
        let (a, _) = RequestState::new(5, tasks(1), 1);
        let (b, _) = RequestState::new(5, tasks(1), 1);
        registry.insert(a.clone()).unwrap();
        assert!(matches!(
            registry.insert(b.clone()),
            Err(SchedulerError::DuplicateRequest(5))
        ));
        registry.remove(&b);
        assert_eq!(registry.len(), 1);
        registry.remove(&a);
        assert_eq!(registry.len(), 0);
    }
}
