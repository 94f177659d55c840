use super::{Component, ComponentHealth, HealthStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Components by unique name. The scheduler registers one entry per
/// dispatch loop (`dispatch_loop_0`, `dispatch_loop_1`, ...).
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<BTreeMap<String, Arc<dyn Component>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, and keeps the existing entry, if the name is taken.
    pub async fn register(&self, component: Arc<dyn Component>) -> bool {
        let name = component.name().to_string();
        let mut components = self.components.write().await;
        if components.contains_key(&name) {
            tracing::warn!(name = %name, "Component already registered");
            return false;
        }
        tracing::debug!(name = %name, "Registering component");
        components.insert(name, component);
        true
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.components.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.components.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.components.read().await.is_empty()
    }

    /// Shutdown order: by priority, then by name.
    pub async fn in_shutdown_order(&self) -> Vec<Arc<dyn Component>> {
        let mut components: Vec<Arc<dyn Component>> =
            self.components.read().await.values().cloned().collect();
        // values are already name-ordered; the sort is stable
        components.sort_by_key(|c| c.shutdown_priority());
        components
    }

    pub async fn health(&self) -> Vec<ComponentHealth> {
        let components: Vec<Arc<dyn Component>> =
            self.components.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(components.len());
        for component in components {
            out.push(component.health().await);
        }
        out
    }

    /// Worst status across all components; healthy when none are registered.
    pub async fn overall_health(&self) -> HealthStatus {
        let mut overall = HealthStatus::Healthy;
        for health in self.health().await {
            if severity(&health.status) > severity(&overall) {
                overall = health.status;
            }
        }
        overall
    }
}

fn severity(status: &HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded { .. } => 1,
        HealthStatus::Unhealthy { .. } => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ShutdownPriority, ShutdownResult};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubComponent {
        name: &'static str,
        priority: ShutdownPriority,
        status: HealthStatus,
    }

    fn component(name: &'static str, priority: ShutdownPriority, status: HealthStatus) -> Arc<dyn Component> {
        Arc::new(StubComponent {
            name,
            priority,
            status,
        })
    }

    #[async_trait]
    impl Component for StubComponent {
        fn name(&self) -> &str {
            self.name
        }

        fn shutdown_priority(&self) -> ShutdownPriority {
            self.priority
        }

        async fn health(&self) -> ComponentHealth {
            ComponentHealth {
                name: self.name.to_string(),
                status: self.status.clone(),
            }
        }

        async fn shutdown(&self, _timeout: Duration) -> ShutdownResult {
            ShutdownResult::Complete { items_processed: 0 }
        }

        async fn force_stop(&self) {}
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let registry = ComponentRegistry::new();
        assert!(registry.is_empty().await);
        assert!(
            registry
                .register(component("dispatch_loop_0", ShutdownPriority::Normal, HealthStatus::Healthy))
                .await
        );
        assert!(
            !registry
                .register(component("dispatch_loop_0", ShutdownPriority::Last, HealthStatus::Healthy))
                .await
        );
        assert_eq!(registry.len().await, 1);
        let kept = registry.get("dispatch_loop_0").await.unwrap();
        assert_eq!(kept.shutdown_priority(), ShutdownPriority::Normal);
        assert!(registry.get("dispatch_loop_1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_order_by_priority_then_name() {
        let registry = ComponentRegistry::new();
        for (name, priority) in [
            ("dispatch_loop_1", ShutdownPriority::Normal),
            ("cache_flush", ShutdownPriority::Last),
            ("admission", ShutdownPriority::First),
            ("dispatch_loop_0", ShutdownPriority::Normal),
        ] {
            registry
                .register(component(name, priority, HealthStatus::Healthy))
                .await;
        }

        let order: Vec<String> = registry
            .in_shutdown_order()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(
            order,
            vec!["admission", "dispatch_loop_0", "dispatch_loop_1", "cache_flush"]
        );
        assert_eq!(
            registry.names().await,
            vec!["admission", "cache_flush", "dispatch_loop_0", "dispatch_loop_1"]
        );
    }

    #[tokio::test]
    async fn test_overall_health_is_worst() {
        let registry = ComponentRegistry::new();
        assert_eq!(registry.overall_health().await, HealthStatus::Healthy);

        registry
            .register(component("dispatch_loop_0", ShutdownPriority::Normal, HealthStatus::Healthy))
            .await;
        let degraded = HealthStatus::Degraded {
            reason: "High queue depth: 900".to_string(),
        };
        registry
            .register(component("dispatch_loop_1", ShutdownPriority::Normal, degraded.clone()))
            .await;
        assert_eq!(registry.overall_health().await, degraded);

        let down = HealthStatus::Unhealthy {
            reason: "dispatch loop is not running".to_string(),
        };
        registry
            .register(component("dispatch_loop_2", ShutdownPriority::Normal, down.clone()))
            .await;
        assert_eq!(registry.overall_health().await, down);
    }
}
