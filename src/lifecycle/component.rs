use async_trait::async_trait;
use std::time::Duration;

/// Lower values shut down first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ShutdownPriority {
    First = 0,
    #[default]
    Normal = 50,
    Last = 100,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ComponentHealth {
    pub name: String,
    #[serde(flatten)]
    pub status: HealthStatus,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ShutdownResult {
    Complete { items_processed: usize },
    Partial { remaining: usize },
    Error { message: String },
}

/// A long-running part of the scheduler that takes part in ordered shutdown.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn shutdown_priority(&self) -> ShutdownPriority {
        ShutdownPriority::Normal
    }

    async fn health(&self) -> ComponentHealth {
        ComponentHealth::healthy(self.name())
    }

    /// Waits up to `timeout` for the component to finish its outstanding work.
    async fn shutdown(&self, timeout: Duration) -> ShutdownResult;

    async fn force_stop(&self);
}
