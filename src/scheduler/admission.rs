use std::sync::Arc;

use super::hasher::ChunkHasher;
use crate::types::{Chunk, ChunkTask, Priority, RequestId};

/// Builds one PENDING task per chunk, preserving caller order.
///
/// An absent chunk collection is treated like an empty one. Chunks that fail
/// fingerprinting come back already FAILED; their siblings are admitted
/// normally. Nothing is queued or cached here.
pub fn admit(
    hasher: &ChunkHasher,
    request_id: RequestId,
    chunks: Option<&[Chunk]>,
    priority: Priority,
) -> Vec<Arc<ChunkTask>> {
    let chunks = match chunks {
        Some(c) if !c.is_empty() => c,
        Some(_) => {
            tracing::debug!(request_id, "Admitting request with no chunks");
            return Vec::new();
        }
        None => {
            tracing::debug!(request_id, "Admitting request with absent chunk collection");
            return Vec::new();
        }
    };

    let last = chunks.len() - 1;
    let fingerprints = hasher.fingerprint_all(chunks);

    chunks
        .iter()
        .zip(fingerprints)
        .enumerate()
        .map(|(position, (chunk, fp))| {
            let terminal = position == last;
            match fp {
                Ok(fp) => Arc::new(ChunkTask::new(
                    chunk.clone(),
                    Some(fp),
                    request_id,
                    priority,
                    position,
                    terminal,
                )),
                Err(e) => {
                    tracing::warn!(request_id, position, error = %e, "Chunk rejected at admission");
                    let task = ChunkTask::new(
                        chunk.clone(),
                        None,
                        request_id,
                        priority,
                        position,
                        terminal,
                    );
                    task.fail_pending(e);
                    Arc::new(task)
                }
            }
        })
        .collect()
}
