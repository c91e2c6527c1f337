//! Transform Engine (C8, engine half): memoizes loader-chain output behind a
//! two-tier cache (in-memory LRU, then the version-namespaced CAS), and
//! coalesces concurrent requests for the same memo key into one execution.

use crate::cas::Cas;
use crate::data::{ModuleId, VersionHash};
use crate::error::TransformError;
use crate::hash::hash_many;
use crate::loader::{LoaderOutput, LoaderRegistry};
use dashmap::DashMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

pub const DEFAULT_LRU_CAPACITY: usize = 5_000;

/// `DEFAULT_LRU_CAPACITY` as a `NonZeroUsize`, computed once at compile
/// time so the fallback path in [`TransformEngine::new`] never needs a
/// runtime `unwrap`.
const DEFAULT_LRU_CAPACITY_NONZERO: NonZeroUsize = match NonZeroUsize::new(DEFAULT_LRU_CAPACITY) {
    Some(n) => n,
    None => panic!("DEFAULT_LRU_CAPACITY must be nonzero"),
};

pub struct EngineCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl EngineCounters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

type InFlight = Arc<OnceCell<Result<LoaderOutput, String>>>;

pub struct TransformEngine {
    registry: LoaderRegistry,
    cas: Arc<Cas>,
    version: VersionHash,
    lru: Mutex<LruCache<String, LoaderOutput>>,
    in_flight: DashMap<String, InFlight>,
    pub counters: EngineCounters,
}

impl TransformEngine {
    pub fn new(registry: LoaderRegistry, cas: Arc<Cas>, version: VersionHash, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_LRU_CAPACITY_NONZERO);
        Self {
            registry,
            cas,
            version,
            lru: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            counters: EngineCounters::new(),
        }
    }

    /// Report `(hits, misses, size)` as `spec.md` §4.8 requires.
    pub async fn counters(&self) -> (u64, u64, usize) {
        let size = self.lru.lock().await.len();
        (
            self.counters.hits.load(Ordering::Relaxed),
            self.counters.misses.load(Ordering::Relaxed),
            size,
        )
    }

    fn memo_key(&self, module_hash: &str, path: &Path, code: &str) -> String {
        let ctx = crate::loader::LoaderContext {
            path,
            code: code.to_string(),
            module_hash,
        };
        let matching = self.registry.matching(&ctx);
        let signature = LoaderRegistry::signature_hash(&matching);
        hash_many(&[module_hash.as_bytes(), &signature.0]).to_hex()
    }

    #[tracing::instrument(level = "debug", skip(self, code))]
    pub async fn run(
        &self,
        path: &Path,
        module_hash: &str,
        code: String,
        artifact_name: &str,
    ) -> Result<LoaderOutput, TransformError> {
        let memo_key = self.memo_key(module_hash, path, &code);

        if let Some(hit) = self.lru.lock().await.get(&memo_key).cloned() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        match self.cas.read(&self.version, &memo_key, artifact_name).await {
            Ok(Some(bytes)) => {
                if let Ok(code) = String::from_utf8(bytes) {
                    let output = LoaderOutput { code, map: None };
                    self.lru.lock().await.put(memo_key.clone(), output.clone());
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(output);
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = ?err, "CAS read failed, falling through to loader chain"),
        }

        let cell = self
            .in_flight
            .entry(memo_key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let registry_result = cell
            .get_or_init(|| async {
                match self.registry.run_chain(path, module_hash, code) {
                    Ok(out) => Ok(out),
                    Err(err) => Err(err.to_string()),
                }
            })
            .await
            .clone();

        self.in_flight.remove(&memo_key);

        match registry_result {
            Ok(output) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.lru.lock().await.put(memo_key.clone(), output.clone());
                if let Err(err) = self
                    .cas
                    .write(&self.version, &memo_key, artifact_name, output.code.as_bytes())
                    .await
                {
                    tracing::warn!(error = ?err, "CAS write failed, continuing with LRU-only result");
                }
                Ok(output)
            }
            Err(message) => Err(TransformError::LoaderFailed {
                loader: "chain".to_string(),
                module: ModuleId::new(path),
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Loader, LoaderContext};
    use std::sync::atomic::AtomicUsize;

    struct CountingLoader(Arc<AtomicUsize>);
    impl Loader for CountingLoader {
        fn name(&self) -> &str {
            "counting"
        }
        fn order(&self) -> i32 {
            0
        }
        fn test(&self, _ctx: &LoaderContext<'_>) -> bool {
            true
        }
        fn transform(&self, ctx: &LoaderContext<'_>) -> Result<Option<crate::loader::LoaderOutput>, TransformError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(crate::loader::LoaderOutput {
                code: format!("{}!", ctx.code),
                map: None,
            }))
        }
    }

    fn engine(counter: Arc<AtomicUsize>) -> TransformEngine {
        let dir = tempfile::tempdir().unwrap();
        let registry = LoaderRegistry::new(vec![Arc::new(CountingLoader(counter))]);
        let cas = Arc::new(Cas::new(dir.path()));
        TransformEngine::new(registry, cas, VersionHash("v1".into()), 100)
    }

    #[tokio::test]
    async fn repeated_runs_with_same_key_are_byte_identical() {
        let counter = Arc::new(AtomicUsize::new(0));
        let engine = engine(counter);
        let path = Path::new("/a.ts");
        let a = engine.run(path, "h1", "src".into(), "transformed.js").await.unwrap();
        let b = engine.run(path, "h1", "src".into(), "transformed.js").await.unwrap();
        assert_eq!(a.code, b.code);
        let (hits, misses, _) = engine.counters().await;
        assert_eq!(misses, 1);
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_execution() {
        let counter = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(engine(counter.clone()));
        let path = Path::new("/a.ts");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.run(path, "h1", "src".into(), "transformed.js").await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        for r in &results {
            assert_eq!(r.code, results[0].code);
        }
    }
}
