use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tokio::sync::watch;

use crate::types::{Embedding, Fingerprint, TaskError, TaskResult};

type Slot = watch::Receiver<Option<TaskResult>>;

struct Entries {
    lru: LruCache<Fingerprint, Embedding>,
    bytes: usize,
}

/// Fingerprint -> embedding store with single-flight computation.
///
/// Two independent locks: `entries` for the LRU table and `in_flight` for
/// computations in progress. When both are needed, `in_flight` is taken
/// first.
pub struct EmbeddingCache {
    entries: Mutex<Entries>,
    in_flight: Mutex<HashMap<Fingerprint, Slot>>,
    max_bytes: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_budget(capacity, None)
    }

    pub fn with_budget(capacity: usize, max_bytes: Option<usize>) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(Entries {
                lru: LruCache::new(cap),
                bytes: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get-or-compute. On a miss exactly one caller's `compute` runs; every
    /// concurrent caller for the same fingerprint receives its result.
    ///
    /// The computation is spawned on the runtime, so dropping any waiter
    /// (including the one that started it) does not abort it. Failures are
    /// delivered to all waiters and never cached.
    pub async fn resolve<F, Fut>(self: &Arc<Self>, fingerprint: Fingerprint, compute: F) -> TaskResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<f32>>> + Send + 'static,
    {
        if let Some(hit) = self.lookup(&fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let mut slot = {
            let mut in_flight = lock(&self.in_flight);
            // A computation may have finished between the lookup and taking the lock.
            if let Some(hit) = self.lookup(&fingerprint) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
            match in_flight.get(&fingerprint) {
                Some(slot) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(fingerprint = %fingerprint.short(), "Joining in-flight computation");
                    slot.clone()
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(fingerprint, rx.clone());
                    self.spawn_computation(fingerprint, compute(), tx);
                    rx
                }
            }
        };

        let published = match slot.wait_for(|v| v.is_some()).await {
            Ok(value) => value
                .clone()
                .unwrap_or_else(|| Err(TaskError::ComputeAborted("empty result".to_string()))),
            Err(_) => Err(TaskError::ComputeAborted(
                "computation dropped before completion".to_string(),
            )),
        };
        published
    }

    fn spawn_computation<Fut>(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        fut: Fut,
        tx: watch::Sender<Option<TaskResult>>,
    ) where
        Fut: Future<Output = anyhow::Result<Vec<f32>>> + Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            // Inner task so a panicking runtime still releases the slot.
            let outcome = match tokio::spawn(fut).await {
                Ok(Ok(vec)) => Ok(Embedding::from(vec)),
                Ok(Err(e)) => Err(TaskError::Compute(e.to_string())),
                Err(e) => Err(TaskError::ComputeAborted(e.to_string())),
            };

            match &outcome {
                Ok(embedding) => cache.insert(fingerprint, embedding.clone()),
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "Embedding computation failed")
                }
            }

            lock(&cache.in_flight).remove(&fingerprint);
            let _ = tx.send(Some(outcome));
        });
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Embedding> {
        lock(&self.entries).lru.get(fingerprint).cloned()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Embedding> {
        match self.lookup(fingerprint) {
            Some(e) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(e)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        lock(&self.entries).lru.contains(fingerprint)
    }

    pub fn insert(&self, fingerprint: Fingerprint, embedding: Embedding) {
        let size = embedding.size_bytes();
        if let Some(max) = self.max_bytes {
            if size > max {
                tracing::debug!(size, max, "Embedding exceeds cache byte budget, not cached");
                return;
            }
        }

        let mut entries = lock(&self.entries);
        entries.bytes += size;
        if let Some((old_key, old)) = entries.lru.push(fingerprint, embedding) {
            entries.bytes -= old.size_bytes();
            if old_key != fingerprint {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(max) = self.max_bytes {
            while entries.bytes > max {
                match entries.lru.pop_lru() {
                    Some((_, old)) => {
                        entries.bytes -= old.size_bytes();
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }
    }

    pub fn is_computing(&self, fingerprint: &Fingerprint) -> bool {
        lock(&self.in_flight).contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = lock(&self.entries);
        entries.lru.clear();
        entries.bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let entries = lock(&self.entries);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: entries.lru.len(),
            bytes: entries.bytes,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub size: usize,
    pub bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ChunkHasher;
    use crate::types::Chunk;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fp(n: u32) -> Fingerprint {
        ChunkHasher::new("cache-test")
            .fingerprint(&Chunk::text(vec![n]))
            .unwrap()
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        value: Vec<f32>,
        delay: Duration,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<Vec<f32>>> + Send>>
    {
        let calls = calls.clone();
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value)
            })
        }
    }

    #[test]
    fn test_cache_basic() {
        let cache = EmbeddingCache::new(2);
        let vec1 = Embedding::from(vec![1.0, 2.0, 3.0]);

        assert!(cache.get(&fp(1)).is_none());
        assert_eq!(cache.stats().misses, 1);

        cache.insert(fp(1), vec1.clone());
        assert_eq!(cache.get(&fp(1)), Some(vec1));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.stats().bytes, 12);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = EmbeddingCache::new(2);

        cache.insert(fp(1), Embedding::from(vec![1.0]));
        cache.insert(fp(2), Embedding::from(vec![2.0]));
        // touch 1 so 2 becomes least recently used
        assert!(cache.get(&fp(1)).is_some());
        cache.insert(fp(3), Embedding::from(vec![3.0]));

        assert!(cache.contains(&fp(1)));
        assert!(!cache.contains(&fp(2)));
        assert!(cache.contains(&fp(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_byte_budget_eviction() {
        let cache = EmbeddingCache::with_budget(100, Some(16));

        cache.insert(fp(1), Embedding::from(vec![0.0; 2]));
        cache.insert(fp(2), Embedding::from(vec![0.0; 2]));
        cache.insert(fp(3), Embedding::from(vec![0.0; 2]));

        let stats = cache.stats();
        assert!(stats.bytes <= 16);
        assert_eq!(stats.size, 2);
        assert!(!cache.contains(&fp(1)));

        cache.insert(fp(4), Embedding::from(vec![0.0; 10]));
        assert!(!cache.contains(&fp(4)));
    }

    #[test]
    fn test_evicted_entry_stays_valid_for_reader() {
        let cache = EmbeddingCache::new(1);
        cache.insert(fp(1), Embedding::from(vec![4.0, 5.0]));
        let held = cache.get(&fp(1)).unwrap();

        cache.insert(fp(2), Embedding::from(vec![6.0]));
        assert!(!cache.contains(&fp(1)));
        assert_eq!(held.as_slice(), &[4.0, 5.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight() {
        let cache = Arc::new(EmbeddingCache::new(16));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let compute = counting(&calls, vec![0.25; 4], Duration::from_millis(50));
            handles.push(tokio::spawn(
                async move { cache.resolve(fp(42), compute).await },
            ));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|e| e.shares_storage(&results[0])));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.coalesced, 15);
        assert!(!cache.is_computing(&fp(42)));
    }

    #[tokio::test]
    async fn test_hit_never_recomputes() {
        let cache = Arc::new(EmbeddingCache::new(16));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .resolve(fp(1), counting(&calls, vec![1.0], Duration::ZERO))
            .await
            .unwrap();
        let second = cache
            .resolve(fp(1), counting(&calls, vec![9.0], Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let cache = Arc::new(EmbeddingCache::new(16));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .resolve(fp(5), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<Vec<f32>, _>(anyhow::anyhow!("device lost"))
                    })
                    .await
            }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert_eq!(err, TaskError::Compute("device lost".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.contains(&fp(5)));

        let retried = cache
            .resolve(fp(5), counting(&calls, vec![2.0], Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(retried.as_slice(), &[2.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_compute_is_reported() {
        let cache = Arc::new(EmbeddingCache::new(4));
        let result = cache
            .resolve(fp(8), || async {
                if true {
                    panic!("kernel crashed");
                }
                Ok(vec![])
            })
            .await;
        assert!(matches!(result, Err(TaskError::ComputeAborted(_))));
        assert!(!cache.is_computing(&fp(8)));
    }

    #[tokio::test]
    async fn test_dropped_leader_does_not_abort_computation() {
        let cache = Arc::new(EmbeddingCache::new(4));
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = tokio::time::timeout(
            Duration::from_millis(5),
            cache.resolve(fp(9), counting(&calls, vec![3.0], Duration::from_millis(40))),
        )
        .await;
        assert!(leader.is_err());
        assert!(cache.is_computing(&fp(9)));

        let follower = cache
            .resolve(fp(9), counting(&calls, vec![7.0], Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(follower.as_slice(), &[3.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
