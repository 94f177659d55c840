use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chunk_sched::config::{BackpressurePolicy, PriorityClasses, SchedulerConfig};
use chunk_sched::lifecycle::{HealthStatus, ShutdownResult};
use chunk_sched::scheduler::{
    BatchCapacity, CacheStats, MetricsSnapshot, MockRuntime, RequestHandle, RequestOutcome,
    TaskSnapshot,
};
use chunk_sched::types::{Chunk, Priority, RequestId};
use chunk_sched::ChunkScheduler;

#[derive(Parser)]
#[command(name = "chunk-sched")]
#[command(about = "Simulates multimodal chunk scheduling against a mock inference runtime")]
struct Cli {
    /// JSON workload file. A synthetic workload is generated when omitted.
    #[arg(long, env = "CHUNK_SCHED_WORKLOAD")]
    workload: Option<PathBuf>,

    #[arg(long, env, default_value = "1000")]
    cache_size: usize,

    /// Cache memory budget in bytes. 0 = count-bounded only.
    #[arg(long, env, default_value = "0")]
    cache_max_bytes: usize,

    #[arg(long, env, default_value = "4096")]
    max_inflight: usize,

    /// What to do when the in-flight budget is exhausted: reject or block.
    #[arg(long, env, default_value = "reject")]
    backpressure: BackpressurePolicy,

    #[arg(long, env, default_value = "2")]
    dispatchers: usize,

    /// Priority classes as label=priority pairs, lower runs first.
    #[arg(long, env, default_value = "vision=0,audio=1,chat=5")]
    priority_classes: PriorityClasses,

    #[arg(long, env = "MODEL_ID", default_value = "mock-embedder")]
    model: String,

    #[arg(long, env, default_value = "64")]
    dims: usize,

    #[arg(long, env = "LATENCY_MS", default_value = "5")]
    latency: u64,

    #[arg(long, env, default_value = "8")]
    max_batch_chunks: usize,

    #[arg(long, env, default_value = "1024")]
    max_batch_tokens: usize,

    #[arg(long, env, default_value = "6")]
    max_batch_sequences: usize,

    /// Synthetic workload: number of requests.
    #[arg(long, default_value = "8")]
    requests: u64,

    /// Synthetic workload: chunks per request.
    #[arg(long, default_value = "6")]
    chunks: usize,

    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value = "5000")]
    shutdown_timeout: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Deserialize)]
struct WorkloadRequest {
    request_id: RequestId,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    chunks: Option<Vec<Chunk>>,
}

#[derive(Serialize)]
struct RequestReport {
    request_id: RequestId,
    #[serde(flatten)]
    outcome: ReportedOutcome,
    tasks: Vec<TaskSnapshot>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ReportedOutcome {
    Finished(RequestOutcome),
    Rejected { rejected: String },
}

#[derive(Serialize)]
struct Report {
    elapsed_ms: u128,
    requests: Vec<RequestReport>,
    metrics: MetricsSnapshot,
    cache: CacheStats,
    health: HealthStatus,
    shutdown: Vec<(String, ShutdownResult)>,
}

/// Requests share a system prompt chunk and an image tile, so the cache has
/// something to coalesce.
fn synthetic_workload(requests: u64, chunks: usize) -> Vec<WorkloadRequest> {
    let shared_prompt = Chunk::text((1..=16).collect::<Vec<u32>>());
    let shared_tile = Chunk::Image {
        width: 8,
        height: 8,
        channels: 3,
        pixels: (0..192).map(|i| (i % 251) as u8).collect(),
        n_tokens: 64,
    };

    (1..=requests)
        .map(|request_id| {
            let chunks = (0..chunks)
                .map(|position| match position {
                    0 => shared_prompt.clone(),
                    p if p % 3 == 1 => shared_tile.clone(),
                    p if p % 3 == 2 => Chunk::Audio {
                        sample_rate: 16_000,
                        samples: (0..160)
                            .map(|s| ((s as u64 + request_id) as f32 * 0.01).sin())
                            .collect(),
                        n_tokens: 10,
                    },
                    p => Chunk::text(vec![request_id as u32, p as u32, 7, 7]),
                })
                .collect();
            let label = match request_id % 3 {
                0 => "vision",
                1 => "chat",
                _ => "audio",
            };
            WorkloadRequest {
                request_id,
                priority: None,
                label: Some(label.to_string()),
                chunks: Some(chunks),
            }
        })
        .collect()
}

fn load_workload(path: &Path) -> anyhow::Result<Vec<WorkloadRequest>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read workload {}: {}", path.display(), e))?;
    let workload = serde_json::from_str(&raw)?;
    Ok(workload)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let workload = match &cli.workload {
        Some(path) => load_workload(path)?,
        None => synthetic_workload(cli.requests, cli.chunks),
    };

    let config = SchedulerConfig {
        cache_capacity: cli.cache_size,
        cache_max_bytes: (cli.cache_max_bytes > 0).then_some(cli.cache_max_bytes),
        max_inflight_tasks: cli.max_inflight,
        backpressure: cli.backpressure,
        dispatchers: cli.dispatchers,
        hash_namespace: cli.model.clone(),
        priority_classes: cli.priority_classes.clone(),
        ..SchedulerConfig::default()
    };

    let runtime = Arc::new(
        MockRuntime::new(cli.dims)
            .with_latency(Duration::from_millis(cli.latency))
            .with_capacity(BatchCapacity {
                max_chunks: cli.max_batch_chunks,
                max_tokens: cli.max_batch_tokens,
                max_sequences: cli.max_batch_sequences,
            }),
    );
    let scheduler = ChunkScheduler::start(config, runtime.clone()).await;

    tracing::info!(
        requests = workload.len(),
        model = %cli.model,
        "Submitting workload"
    );
    let started = Instant::now();

    let mut submitted: Vec<(RequestId, Result<RequestHandle, String>)> = Vec::new();
    for request in &workload {
        let chunks = request.chunks.as_deref();
        let result = match (&request.label, request.priority) {
            (_, Some(priority)) => scheduler.enqueue(request.request_id, chunks, priority).await,
            (Some(label), None) => {
                scheduler
                    .enqueue_labeled(request.request_id, chunks, label)
                    .await
            }
            (None, None) => scheduler.enqueue(request.request_id, chunks, 0).await,
        };
        if let Err(e) = &result {
            tracing::warn!(request_id = request.request_id, "Request rejected: {}", e);
        }
        submitted.push((request.request_id, result.map_err(|e| e.to_string())));
    }

    let mut requests = Vec::with_capacity(submitted.len());
    for (request_id, result) in submitted {
        let report = match result {
            Ok(handle) => {
                let outcome = handle.wait().await;
                tracing::info!(request_id, outcome = ?outcome, "Request finished");
                RequestReport {
                    request_id,
                    outcome: ReportedOutcome::Finished(outcome),
                    tasks: handle.snapshot(),
                }
            }
            Err(reason) => RequestReport {
                request_id,
                outcome: ReportedOutcome::Rejected { rejected: reason },
                tasks: Vec::new(),
            },
        };
        requests.push(report);
    }
    let elapsed_ms = started.elapsed().as_millis();

    tracing::info!(
        runtime_calls = runtime.calls(),
        elapsed_ms,
        "Workload complete, shutting down"
    );
    let health = scheduler.overall_health().await;
    let shutdown = scheduler
        .shutdown(Duration::from_millis(cli.shutdown_timeout))
        .await;

    let report = Report {
        elapsed_ms,
        requests,
        metrics: scheduler.metrics(),
        cache: scheduler.cache_stats(),
        health,
        shutdown,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!("Shutdown complete");
    Ok(())
}
