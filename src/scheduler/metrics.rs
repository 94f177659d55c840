use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub queue_depth: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub submitted_total: AtomicU64,
    pub dispatched_total: AtomicU64,
    pub completed_total: AtomicU64,
    pub failed_total: AtomicU64,
    pub cancelled_total: AtomicU64,
    pub deferred_total: AtomicU64,
    pub batches_total: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_queue(&self, count: usize) {
        self.queue_depth.fetch_add(count, Ordering::Relaxed);
    }

    pub fn dec_queue(&self, count: usize) {
        // Saturating: requeues and removals may race with the depth update.
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(count))
            });
    }

    pub fn inc_in_flight(&self, count: usize) {
        self.in_flight.fetch_add(count, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self, count: usize) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(count))
            });
    }

    pub fn inc_submitted(&self, count: u64) {
        self.submitted_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_dispatched(&self, count: u64) {
        self.dispatched_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_completed(&self, count: u64) {
        self.completed_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_failed(&self, count: u64) {
        self.failed_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_cancelled(&self, count: u64) {
        self.cancelled_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_deferred(&self, count: u64) {
        self.deferred_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn get_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_depth: self.get_queue_depth(),
            in_flight: self.get_in_flight(),
            submitted_total: self.submitted_total.load(Ordering::Relaxed),
            dispatched_total: self.dispatched_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            deferred_total: self.deferred_total.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub submitted_total: u64,
    pub dispatched_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
    pub deferred_total: u64,
    pub batches_total: u64,
}
