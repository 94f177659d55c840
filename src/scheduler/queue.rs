use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::types::{ChunkTask, Priority, RequestId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueKey {
    priority: Priority,
    request_id: RequestId,
    position: usize,
}

impl QueueKey {
    fn of(task: &ChunkTask) -> Self {
        Self {
            priority: task.priority(),
            request_id: task.request_id(),
            position: task.position(),
        }
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.request_id.cmp(&other.request_id))
            .then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Serving order: lower priority value first, then lower request id, then
/// earlier chunk position within the request.
pub fn dispatch_order(a: &ChunkTask, b: &ChunkTask) -> Ordering {
    QueueKey::of(a).cmp(&QueueKey::of(b))
}

/// Ordered holding area for WAIT tasks.
#[derive(Default)]
pub struct PriorityQueue {
    tasks: Mutex<BTreeMap<QueueKey, Arc<ChunkTask>>>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, BTreeMap<QueueKey, Arc<ChunkTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a PENDING task (PENDING -> WAIT). Returns the task's current
    /// status if it was not PENDING.
    pub fn push(&self, task: Arc<ChunkTask>) -> Result<(), TaskStatus> {
        {
            let mut tasks = self.tasks();
            if !task.mark_waiting() {
                return Err(task.status());
            }
            tasks.insert(QueueKey::of(&task), task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Puts back a task that was popped but not dispatched. It keeps its key,
    /// so it lands at the front of its class again.
    pub fn requeue(&self, task: Arc<ChunkTask>) -> bool {
        if task.status() != TaskStatus::Wait {
            return false;
        }
        self.tasks().insert(QueueKey::of(&task), task);
        true
    }

    pub fn pop(&self) -> Option<Arc<ChunkTask>> {
        self.tasks().pop_first().map(|(_, task)| task)
    }

    /// Removes every queued task of one request, in order.
    pub fn remove_request(&self, request_id: RequestId) -> Vec<Arc<ChunkTask>> {
        let mut tasks = self.tasks();
        let keys: Vec<QueueKey> = tasks
            .keys()
            .filter(|k| k.request_id == request_id)
            .copied()
            .collect();
        keys.iter().filter_map(|k| tasks.remove(k)).collect()
    }

    pub fn drain(&self) -> Vec<Arc<ChunkTask>> {
        std::mem::take(&mut *self.tasks()).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Resolves after the next push (or immediately if a push happened
    /// since the last wake-up was consumed).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
