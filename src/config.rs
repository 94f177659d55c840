use std::collections::HashMap;
use std::time::Duration;

use crate::types::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Refuse admission when the in-flight budget is exhausted.
    #[default]
    Reject,
    /// Hold the producer until enough tasks resolve.
    Block,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" | "wait" => Ok(Self::Block),
            _ => Err(format!("Unknown backpressure policy: {}", s)),
        }
    }
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Maps business task labels to scheduling priorities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityClasses {
    classes: HashMap<String, Priority>,
    default_priority: Priority,
}

impl PriorityClasses {
    /// Pairs labels with priorities positionally; extra entries on either side
    /// are ignored.
    pub fn from_pairs<L, S>(labels: L, priorities: &[Priority]) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let classes = labels
            .into_iter()
            .zip(priorities.iter().copied())
            .map(|(label, prio)| (label.into(), prio))
            .collect();
        Self {
            classes,
            default_priority: 0,
        }
    }

    pub fn with_default(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn insert(&mut self, label: impl Into<String>, priority: Priority) {
        self.classes.insert(label.into(), priority);
    }

    pub fn priority_of(&self, label: &str) -> Priority {
        self.classes
            .get(label)
            .copied()
            .unwrap_or(self.default_priority)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Parses `label=priority` pairs separated by commas, e.g. `vision=0,chat=5`.
impl std::str::FromStr for PriorityClasses {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = PriorityClasses::default();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (label, prio) = pair
                .split_once('=')
                .ok_or_else(|| format!("Expected label=priority, got: {}", pair))?;
            let prio: Priority = prio
                .trim()
                .parse()
                .map_err(|_| format!("Invalid priority for {}: {}", label, prio))?;
            out.insert(label.trim(), prio);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of cached embeddings.
    pub cache_capacity: usize,
    /// Optional memory budget for cached embeddings, in bytes.
    pub cache_max_bytes: Option<usize>,
    /// Tasks admitted but not yet resolved, across all requests.
    pub max_inflight_tasks: usize,
    pub backpressure: BackpressurePolicy,
    /// Number of concurrent dispatch loops.
    pub dispatchers: usize,
    /// Pause after a cycle that only produced deferrals.
    pub defer_backoff: Duration,
    /// Queue depth above which health reports degraded.
    pub degraded_queue_depth: usize,
    /// Mixed into every fingerprint, normally the model id.
    pub hash_namespace: String,
    pub priority_classes: PriorityClasses,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            cache_max_bytes: None,
            max_inflight_tasks: 4096,
            backpressure: BackpressurePolicy::Reject,
            dispatchers: 1,
            defer_backoff: Duration::from_millis(2),
            degraded_queue_depth: 500,
            hash_namespace: "default".to_string(),
            priority_classes: PriorityClasses::default(),
        }
    }
}
