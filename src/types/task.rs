use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use super::chunk::Chunk;
use super::error::TaskError;

/// Completion request identifier (`cmpl_id`).
pub type RequestId = u64;

/// Scheduling priority. Numerically smaller values are served first.
pub type Priority = i32;

pub type TaskResult = std::result::Result<Embedding, TaskError>;

/// Content digest of a chunk's normalized payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    pub fn from_hash(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// First 12 hex digits, enough to tell fingerprints apart in logs.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Reference-counted embedding vector. The cache and every task that
/// received it hold independent handles.
#[derive(Clone, PartialEq)]
pub struct Embedding(Arc<[f32]>);

impl Embedding {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.0.len() * std::mem::size_of::<f32>()
    }

    /// True when both handles point at the same allocation.
    pub fn shares_storage(&self, other: &Embedding) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(v: Vec<f32>) -> Self {
        Self(Arc::from(v))
    }
}

impl std::fmt::Debug for Embedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Embedding(dim={})", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskStatus {
    /// Constructed, not yet admitted to the queue.
    Pending = 0,
    /// Queued and eligible for dispatch.
    Wait = 1,
    /// Selected by a dispatch loop; inference requested.
    InProgress = 2,
    Completed = 3,
    Failed = 4,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Wait,
            2 => Self::InProgress,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only transition table.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Wait)
                | (Self::Pending, Self::Failed)
                | (Self::Wait, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Wait => write!(f, "wait"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One chunk of one request, tracked independently through scheduling.
pub struct ChunkTask {
    chunk: Chunk,
    fingerprint: Option<Fingerprint>,
    request_id: RequestId,
    priority: Priority,
    position: usize,
    terminal: bool,
    status: AtomicU8,
    result: OnceLock<TaskResult>,
}

impl ChunkTask {
    pub fn new(
        chunk: Chunk,
        fingerprint: Option<Fingerprint>,
        request_id: RequestId,
        priority: Priority,
        position: usize,
        terminal: bool,
    ) -> Self {
        Self {
            chunk,
            fingerprint,
            request_id,
            priority,
            position,
            terminal,
            status: AtomicU8::new(TaskStatus::Pending as u8),
            result: OnceLock::new(),
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Index of this chunk within its request.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Atomically moves `from -> to`. Returns the observed status on failure.
    pub fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        if !from.can_transition_to(to) {
            return Err(self.status());
        }
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }

    /// PENDING -> WAIT.
    pub fn mark_waiting(&self) -> bool {
        self.transition(TaskStatus::Pending, TaskStatus::Wait).is_ok()
    }

    /// WAIT -> IN_PROGRESS. Succeeds for exactly one caller; the winner owns
    /// the result slot.
    pub fn claim(&self) -> bool {
        self.transition(TaskStatus::Wait, TaskStatus::InProgress)
            .is_ok()
    }

    /// Attaches the result and publishes the terminal status. Only the
    /// claimant may call this.
    pub fn resolve(&self, result: TaskResult) -> bool {
        let next = if result.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if self.status() != TaskStatus::InProgress || self.result.set(result).is_err() {
            return false;
        }
        self.transition(TaskStatus::InProgress, next).is_ok()
    }

    /// PENDING -> FAILED, used when the chunk cannot be admitted.
    pub fn fail_pending(&self, error: TaskError) -> bool {
        if self.status() != TaskStatus::Pending || self.result.set(Err(error)).is_err() {
            return false;
        }
        self.transition(TaskStatus::Pending, TaskStatus::Failed)
            .is_ok()
    }

    /// Result, visible once the task reached a terminal status.
    pub fn result(&self) -> Option<&TaskResult> {
        if self.status().is_terminal() {
            self.result.get()
        } else {
            None
        }
    }

    pub fn embedding(&self) -> Option<Embedding> {
        match self.result() {
            Some(Ok(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<TaskError> {
        match self.result() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ChunkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTask")
            .field("request_id", &self.request_id)
            .field("position", &self.position)
            .field("priority", &self.priority)
            .field("kind", &self.chunk.kind())
            .field("terminal", &self.terminal)
            .field("status", &self.status())
            .finish()
    }
}
