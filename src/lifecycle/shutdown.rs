use super::{ComponentRegistry, ShutdownResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    ForceStop,
    Complete,
}

/// Drives registered components through draining and force-stop phases.
pub struct ShutdownCoordinator {
    registry: Arc<ComponentRegistry>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self { registry, phase_tx }
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Components drain concurrently within the whole budget; anything still
    /// running afterwards is force-stopped in reverse priority order.
    pub async fn shutdown(&self, total_timeout: Duration) -> Vec<(String, ShutdownResult)> {
        let components = self.registry.in_shutdown_order().await;

        self.phase_tx.send_replace(ShutdownPhase::Draining);
        tracing::info!(components = components.len(), "Shutdown phase 1: draining");

        let mut drains = tokio::task::JoinSet::new();
        for (idx, component) in components.iter().enumerate() {
            let component = Arc::clone(component);
            drains.spawn(async move {
                let result = tokio::time::timeout(total_timeout, component.shutdown(total_timeout))
                    .await
                    .unwrap_or(ShutdownResult::Partial { remaining: 0 });
                (idx, result)
            });
        }

        let mut results: Vec<Option<ShutdownResult>> = vec![None; components.len()];
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => tracing::error!("Component drain task failed: {}", e),
            }
        }

        self.phase_tx.send_replace(ShutdownPhase::ForceStop);
        tracing::info!("Shutdown phase 2: force stopping remaining");

        for component in components.iter().rev() {
            component.force_stop().await;
        }

        self.phase_tx.send_replace(ShutdownPhase::Complete);
        tracing::info!("Shutdown complete");

        components
            .iter()
            .zip(results)
            .map(|(c, r)| {
                let result = r.unwrap_or(ShutdownResult::Error {
                    message: "drain task failed".to_string(),
                });
                (c.name().to_string(), result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Component;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Slow {
        delay: Duration,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Component for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn shutdown(&self, _timeout: Duration) -> ShutdownResult {
            tokio::time::sleep(self.delay).await;
            ShutdownResult::Complete { items_processed: 3 }
        }

        async fn force_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_phases_and_results() {
        let registry = Arc::new(ComponentRegistry::new());
        let component = Arc::new(Slow {
            delay: Duration::from_millis(1),
            stopped: AtomicBool::new(false),
        });
        registry.register(component.clone()).await;

        let coordinator = ShutdownCoordinator::new(registry);
        assert_eq!(coordinator.phase(), ShutdownPhase::Running);

        let results = coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(coordinator.phase(), ShutdownPhase::Complete);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "slow");
        assert_eq!(results[0].1, ShutdownResult::Complete { items_processed: 3 });
        assert!(component.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_reports_partial() {
        let registry = Arc::new(ComponentRegistry::new());
        registry
            .register(Arc::new(Slow {
                delay: Duration::from_secs(5),
                stopped: AtomicBool::new(false),
            }))
            .await;

        let results = ShutdownCoordinator::new(registry)
            .shutdown(Duration::from_millis(20))
            .await;
        assert!(matches!(results[0].1, ShutdownResult::Partial { .. }));
    }
}
