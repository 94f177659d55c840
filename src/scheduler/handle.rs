use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

use super::metrics::SchedulerMetrics;
use crate::lifecycle::{
    Component, ComponentHealth, HealthStatus, ShutdownPriority, ShutdownResult,
};

/// Lifecycle wrapper around one spawned dispatch loop.
pub struct DispatchHandle {
    name: String,
    handle: Mutex<Option<JoinHandle<usize>>>,
    abort: AbortHandle,
    metrics: Arc<SchedulerMetrics>,
    degraded_queue_depth: usize,
}

impl DispatchHandle {
    pub fn new(
        name: String,
        handle: JoinHandle<usize>,
        metrics: Arc<SchedulerMetrics>,
        degraded_queue_depth: usize,
    ) -> Self {
        let abort = handle.abort_handle();
        Self {
            name,
            handle: Mutex::new(Some(handle)),
            abort,
            metrics,
            degraded_queue_depth,
        }
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    async fn take_handle(&self) -> Option<JoinHandle<usize>> {
        self.handle.lock().await.take()
    }
}

#[async_trait]
impl Component for DispatchHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown_priority(&self) -> ShutdownPriority {
        ShutdownPriority::Normal
    }

    async fn health(&self) -> ComponentHealth {
        if self.is_finished() {
            return ComponentHealth {
                name: self.name.clone(),
                status: HealthStatus::Unhealthy {
                    reason: "dispatch loop is not running".to_string(),
                },
            };
        }
        let queue_depth = self.metrics.get_queue_depth();
        if queue_depth > self.degraded_queue_depth {
            ComponentHealth {
                name: self.name.clone(),
                status: HealthStatus::Degraded {
                    reason: format!("High queue depth: {}", queue_depth),
                },
            }
        } else {
            ComponentHealth::healthy(self.name.clone())
        }
    }

    async fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        tracing::info!(
            name = %self.name,
            queue_depth = self.metrics.get_queue_depth(),
            "Dispatch loop draining"
        );

        let Some(mut handle) = self.take_handle().await else {
            return ShutdownResult::Complete { items_processed: 0 };
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(processed)) => ShutdownResult::Complete {
                items_processed: processed,
            },
            Ok(Err(e)) => {
                tracing::error!(name = %self.name, "Dispatch loop failed: {}", e);
                ShutdownResult::Error {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                tracing::warn!(name = %self.name, "Dispatch loop drain timed out");
                ShutdownResult::Partial {
                    remaining: self.metrics.get_queue_depth(),
                }
            }
        }
    }

    async fn force_stop(&self) {
        if !self.abort.is_finished() {
            tracing::warn!(name = %self.name, "Force stopping dispatch loop");
            self.abort.abort();
        }
    }
}
