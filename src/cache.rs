//! Context cache with per-session generation counters.
//!
//! Entries are never swept on mutation. Bumping a session's generation makes
//! every entry stored under an older generation read as a miss.

use crate::error::{BackgroundError, BackgroundTask, ContextError, Result};
use crate::types::{AssembledContext, CacheEntry, ContextBuildOptions};
use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Pluggable storage behind [`ContextCache`]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()>;

    /// Increment and return the session's generation
    async fn bump_generation(&self, session_id: &str) -> Result<u64>;

    async fn get_generation(&self, session_id: &str) -> Result<u64>;

    /// Average encoded/raw payload size, for backends that serialize entries
    fn compression_ratio(&self) -> Option<f64> {
        None
    }
}

struct StoredEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// LRU-bounded session generations.
///
/// Sessions without a slot read as `floor`, the highest generation ever
/// evicted, so an evicted session never falls back to a value its stale
/// entries were written under.
struct GenerationTable {
    sessions: LruCache<String, u64>,
    floor: u64,
}

impl GenerationTable {
    fn current(&mut self, session_id: &str) -> u64 {
        self.sessions.get(session_id).copied().unwrap_or(self.floor)
    }

    fn bump(&mut self, session_id: &str) -> u64 {
        let next = self.current(session_id) + 1;
        if let Some((evicted, generation)) = self.sessions.push(session_id.to_string(), next) {
            if evicted != session_id {
                self.floor = self.floor.max(generation);
            }
        }
        next
    }
}

/// Process-local backend: LRU-bounded entries plus a generation table
pub struct InMemoryCacheBackend {
    entries: Mutex<LruCache<String, StoredEntry>>,
    generations: Mutex<GenerationTable>,
}

impl InMemoryCacheBackend {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generations: Mutex::new(GenerationTable {
                sessions: LruCache::new(capacity),
                floor: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.entry.clone())),
            Some(_) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let stored = StoredEntry {
            entry,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), stored);
        Ok(())
    }

    async fn bump_generation(&self, session_id: &str) -> Result<u64> {
        Ok(self.generations.lock().bump(session_id))
    }

    async fn get_generation(&self, session_id: &str) -> Result<u64> {
        Ok(self.generations.lock().current(session_id))
    }
}

/// Deterministic cache key over (node id, serialized options, prompt hash)
pub fn fingerprint(node_id: &str, options: &ContextBuildOptions, prompt: &str) -> Result<String> {
    let prompt_hash = hex::encode(Sha256::digest(prompt.as_bytes()));
    let options_json = serde_json::to_string(options)?;

    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(options_json.as_bytes());
    hasher.update(b"\n");
    hasher.update(prompt_hash.as_bytes());
    Ok(format!("ctx:{}", hex::encode(hasher.finalize())))
}

/// Outcome of [`ContextCache::lookup`]
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Arc<AssembledContext>),
    /// Miss; store the rebuilt context under this generation
    Miss { generation: u64 },
    /// Backend failed: build uncached
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub builds: u64,
    pub avg_latency_ms: f64,
    pub compression_ratio: Option<f64>,
}

struct WriteBehind {
    tasks: Mutex<JoinSet<()>>,
    errors: mpsc::UnboundedSender<BackgroundError>,
}

/// Cache service in front of a [`CacheBackend`], with hit/latency instrumentation
pub struct ContextCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    builds: AtomicU64,
    latency_total_us: AtomicU64,
    write_behind: Option<WriteBehind>,
}

impl ContextCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            write_behind: None,
        }
    }

    /// Move writes off the build path. Failed writes are reported on the
    /// returned channel; [`ContextCache::flush`] waits for pending ones.
    pub fn with_write_behind(mut self) -> (Self, mpsc::UnboundedReceiver<BackgroundError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write_behind = Some(WriteBehind {
            tasks: Mutex::new(JoinSet::new()),
            errors: tx,
        });
        (self, rx)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read the latest generation, then the entry. Stale or expired entries are misses.
    pub async fn lookup(&self, key: &str, session_id: &str) -> CacheLookup {
        let generation = match self.backend.get_generation(session_id).await {
            Ok(g) => g,
            Err(e) => return self.unavailable("get_generation", e),
        };

        match self.backend.get(key).await {
            Ok(Some(entry)) if entry.is_valid(generation, self.ttl, Utc::now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: key={}, generation={}", key, generation);
                CacheLookup::Hit(entry.context)
            }
            Ok(Some(entry)) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Cache stale: key={}, entry generation={}, current={}",
                    key, entry.generation, generation
                );
                CacheLookup::Miss { generation }
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss { generation }
            }
            Err(e) => self.unavailable("get", e),
        }
    }

    fn unavailable(&self, op: &str, e: ContextError) -> CacheLookup {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        warn!("Cache backend {} failed on {}: {}. Building uncached.", self.backend.name(), op, e);
        CacheLookup::Unavailable
    }

    /// Write an entry under the generation observed at lookup time.
    /// Failures are logged and counted, never returned.
    pub async fn store(&self, key: &str, session_id: &str, generation: u64, context: Arc<AssembledContext>) {
        let entry = CacheEntry {
            context,
            session_id: session_id.to_string(),
            generation,
            created_at: Utc::now(),
        };

        match &self.write_behind {
            Some(wb) => {
                let backend = Arc::clone(&self.backend);
                let errors = wb.errors.clone();
                let key = key.to_string();
                let ttl = self.ttl;
                let mut tasks = wb.tasks.lock();
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move {
                    if let Err(error) = backend.set(&key, entry, ttl).await {
                        let _ = errors.send(BackgroundError {
                            task: BackgroundTask::CacheWrite,
                            key,
                            error,
                        });
                    }
                });
            }
            None => {
                if let Err(e) = self.backend.set(key, entry, self.ttl).await {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Cache write failed for {}: {}", key, e);
                }
            }
        }
    }

    pub async fn invalidate_session(&self, session_id: &str) -> Result<u64> {
        let generation = self.backend.bump_generation(session_id).await?;
        debug!("Session {} invalidated, generation={}", session_id, generation);
        Ok(generation)
    }

    pub fn record_build(&self, latency: Duration) {
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let builds = self.builds.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            backend: self.backend.name(),
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            builds,
            avg_latency_ms: if builds == 0 {
                0.0
            } else {
                self.latency_total_us.load(Ordering::Relaxed) as f64 / builds as f64 / 1000.0
            },
            compression_ratio: self.backend.compression_ratio(),
        }
    }

    /// Wait for pending background writes
    pub async fn flush(&self) {
        let Some(wb) = &self.write_behind else {
            return;
        };
        let mut tasks = std::mem::replace(&mut *wb.tasks.lock(), JoinSet::new());
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!("Background cache write panicked: {}", e);
            }
        }
    }
}
