//! Integration tests for the cache controller.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use llm_cache_tier::cache::controller::{CacheController, KeyState, MigrationStatus, Tiers};
use llm_cache_tier::cache::entry::{unix_millis, CacheEntry, CacheKey, EntryMetadata, RequestFeatures, Tier};
use llm_cache_tier::cache::metrics::CacheMetrics;
use llm_cache_tier::config::Config;
use llm_cache_tier::tier::archive::{ArchiveTier, MemoryObjectStore, ObjectStore, ObjectStoreError, StoredObject};
use llm_cache_tier::tier::hot::HotTier;
use llm_cache_tier::tier::warm::WarmTier;
use llm_cache_tier::tier::{BackendError, TierBackend};
use llm_cache_tier::upstream::{EchoUpstream, GenerationRequest, Upstream};
use llm_cache_tier::worker::ArchivalWorker;

async fn build(dir: &TempDir, warm: Option<Arc<dyn TierBackend>>) -> Arc<CacheController> {
    build_with(dir, warm, Arc::new(MemoryObjectStore::new())).await
}

async fn build_with(
    dir: &TempDir,
    warm: Option<Arc<dyn TierBackend>>,
    store: Arc<dyn ObjectStore>,
) -> Arc<CacheController> {
    let config = Config::default();
    let metrics = Arc::new(CacheMetrics::new().unwrap());
    let warm = match warm {
        Some(warm) => warm,
        None => Arc::new(WarmTier::open(dir.path().join("warm")).await.unwrap()),
    };
    let archive: Arc<dyn TierBackend> = Arc::new(ArchiveTier::new(store, &config.archive));
    let worker = Arc::new(ArchivalWorker::new(
        &config,
        warm.clone(),
        archive.clone(),
        metrics.clone(),
    ));
    let controller = CacheController::new(
        &config,
        Tiers {
            hot: Arc::new(HotTier::new(config.tiers.hot_capacity)),
            warm,
            archive: Some(archive),
        },
        metrics,
    )
    .with_worker(worker);
    Arc::new(controller)
}

fn warm_features() -> RequestFeatures {
    RequestFeatures {
        time_variance: Some(0.9),
        ..Default::default()
    }
}

/// Warm backend that is always down.
struct DownBackend;

#[async_trait]
impl TierBackend for DownBackend {
    fn tier(&self) -> Tier {
        Tier::Warm
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        Err(BackendError::unavailable(Tier::Warm, "disk unplugged"))
    }

    async fn set(&self, _: &CacheKey, _: &CacheEntry, _: Duration) -> Result<CacheEntry, BackendError> {
        Err(BackendError::unavailable(Tier::Warm, "disk unplugged"))
    }

    async fn replace_if(
        &self,
        _: &CacheKey,
        _: u64,
        _: &CacheEntry,
        _: Duration,
    ) -> Result<Option<CacheEntry>, BackendError> {
        Err(BackendError::unavailable(Tier::Warm, "disk unplugged"))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<bool, BackendError> {
        Err(BackendError::unavailable(Tier::Warm, "disk unplugged"))
    }

    async fn list_expiring(&self, _window: Duration) -> Result<Vec<CacheKey>, BackendError> {
        Err(BackendError::unavailable(Tier::Warm, "disk unplugged"))
    }
}

/// Wraps a backend with adjustable latency and injected delete failures.
struct Instrumented {
    inner: Arc<dyn TierBackend>,
    get_delay_ms: AtomicU64,
    set_delay_ms: AtomicU64,
    failing_deletes: AtomicU32,
}

impl Instrumented {
    fn wrap(inner: Arc<dyn TierBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            get_delay_ms: AtomicU64::new(0),
            set_delay_ms: AtomicU64::new(0),
            failing_deletes: AtomicU32::new(0),
        })
    }

    fn delay_gets(&self, ms: u64) {
        self.get_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn delay_sets(&self, ms: u64) {
        self.set_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TierBackend for Instrumented {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    /// Reads first, then stalls: the caller acts on a snapshot that may be stale.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        let snapshot = self.inner.get(key).await;
        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        snapshot
    }

    async fn set(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<CacheEntry, BackendError> {
        let delay = self.set_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.set(key, entry, ttl).await
    }

    async fn replace_if(
        &self,
        key: &CacheKey,
        expected_revision: u64,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<Option<CacheEntry>, BackendError> {
        self.inner.replace_if(key, expected_revision, entry, ttl).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let fail = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BackendError::unavailable(self.tier(), "injected delete failure"));
        }
        self.inner.delete(key).await
    }

    async fn list_expiring(&self, window: Duration) -> Result<Vec<CacheKey>, BackendError> {
        self.inner.list_expiring(window).await
    }

    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        self.inner.sweep_expired().await
    }
}

/// Object store whose deletes can be made slow.
struct SlowDeletes {
    inner: MemoryObjectStore,
    delete_delay_ms: AtomicU64,
}

#[async_trait]
impl ObjectStore for SlowDeletes {
    async fn put_object(&self, name: &str, blob: Bytes, expires_at: u64) -> Result<(), ObjectStoreError> {
        self.inner.put_object(name, blob, expires_at).await
    }

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, ObjectStoreError> {
        self.inner.get_object(name).await
    }

    async fn delete_object(&self, name: &str) -> Result<bool, ObjectStoreError> {
        let delay = self.delete_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.inner.delete_object(name).await
    }

    async fn list_expiring(&self, horizon_ms: u64) -> Result<Vec<String>, ObjectStoreError> {
        self.inner.list_expiring(horizon_ms).await
    }
}

async fn instrumented_warm(dir: &TempDir) -> Arc<Instrumented> {
    let warm: Arc<dyn TierBackend> = Arc::new(WarmTier::open(dir.path().join("warm")).await.unwrap());
    Instrumented::wrap(warm)
}

#[tokio::test]
async fn test_round_trip_increments_access_count_once() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let key = CacheKey::for_request("gemma-3-270m", "What is Rust?");

    let put = controller
        .put(&key, Bytes::from("A systems language."), RequestFeatures::default())
        .await;
    assert_eq!(put.tier, Tier::Hot);

    let hit = controller.lookup(&key).await;
    assert!(hit.found);
    assert_eq!(hit.payload.unwrap(), Bytes::from("A systems language."));
    assert_eq!(hit.metadata.unwrap().access_count, 1);

    for expected in 2..=5 {
        let hit = controller.lookup(&key).await;
        assert_eq!(hit.metadata.unwrap().access_count, expected);
    }
}

#[tokio::test]
async fn test_sliding_ttl_grows_with_hits() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let key = CacheKey::for_request("m", "popular");

    controller.put(&key, Bytes::from("v"), RequestFeatures::default()).await;
    let mut last = 0;
    for _ in 0..3 {
        let ttl = controller.lookup(&key).await.metadata.unwrap().ttl_seconds;
        assert!(ttl > last);
        last = ttl;
    }
    // 3 hits: 3600 × (1 + 0.25·ln 4)
    assert_eq!(last, 4847);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_call_upstream_once() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let upstream = Arc::new(EchoUpstream::with_latency(Duration::from_millis(100)));
    let key = CacheKey::for_request("m", "stampede");

    let mut handles = Vec::new();
    for i in 0..10 {
        let controller = controller.clone();
        let upstream = upstream.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let request = GenerationRequest {
                request_id: format!("req-{i}"),
                model: "m".to_string(),
                prompt: "stampede".to_string(),
                max_tokens: 16,
            };
            controller
                .get_or_compute(&key, RequestFeatures::default(), move || async move {
                    upstream
                        .generate(&request)
                        .await
                        .map(|c| Bytes::from(c.text))
                })
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let resolved = handle.await.unwrap();
        assert_eq!(resolved.payload, Bytes::from("LLM response to: stampede"));
    }
    assert_eq!(upstream.calls(), 1);
    assert_eq!(controller.metrics().upstream_calls.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lookup_never_misses_during_migration() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let key = CacheKey::for_request("m", "on the move");
    controller.put(&key, Bytes::from("payload"), RequestFeatures::default()).await;

    let done = Arc::new(AtomicBool::new(false));
    let migrator = {
        let controller = controller.clone();
        let key = key.clone();
        let done = done.clone();
        tokio::spawn(async move {
            for round in 0..60 {
                let to = match round % 3 {
                    0 => Tier::Warm,
                    1 => Tier::Archive,
                    _ => Tier::Hot,
                };
                let status = controller.migrate(&key, to).await.unwrap();
                assert_ne!(status, MigrationStatus::NotFound);
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let controller = controller.clone();
        let key = key.clone();
        let done = done.clone();
        readers.push(tokio::spawn(async move {
            let mut lookups = 0;
            while !done.load(Ordering::SeqCst) || lookups < 20 {
                let result = controller.lookup(&key).await;
                assert!(result.found, "lookup missed mid-migration");
                assert_eq!(result.payload.unwrap(), Bytes::from("payload"));
                lookups += 1;
            }
        }));
    }

    migrator.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test]
async fn test_warm_entries_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let key = CacheKey::for_request("m", "durable");
    {
        let controller = build(&tmp, None).await;
        let put = controller.put(&key, Bytes::from("kept"), warm_features()).await;
        assert_eq!(put.tier, Tier::Warm);
    }

    let controller = build(&tmp, None).await;
    let hit = controller.lookup(&key).await;
    assert!(hit.found);
    assert_eq!(hit.tier, Some(Tier::Warm));
    assert_eq!(hit.payload.unwrap(), Bytes::from("kept"));
}

#[tokio::test]
async fn test_corrupt_warm_entry_is_a_miss() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let key = CacheKey::for_request("m", "bitrot");
    controller.put(&key, Bytes::from("v"), warm_features()).await;

    let path = tmp
        .path()
        .join("warm")
        .join(key.shard())
        .join(format!("{key}.entry"));
    std::fs::write(&path, b"not an entry").unwrap();

    let result = controller.lookup(&key).await;
    assert!(!result.found);
    assert_eq!(
        controller
            .metrics()
            .backend_errors
            .with_label_values(&["warm"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_unavailable_warm_tier_degrades_to_hot() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, Some(Arc::new(DownBackend))).await;
    let key = CacheKey::for_request("m", "no disk");

    let put = controller.put(&key, Bytes::from("v"), warm_features()).await;
    assert_eq!(put.tier, Tier::Hot);
    assert!(controller.lookup(&key).await.found);

    let other = CacheKey::for_request("m", "never stored");
    assert!(!controller.lookup(&other).await.found);
}

#[tokio::test]
async fn test_state_and_delete() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let key = CacheKey::for_request("m", "short lived");

    assert_eq!(controller.state(&key).await, KeyState::Absent);
    controller.put(&key, Bytes::from("v"), warm_features()).await;
    assert_eq!(controller.state(&key).await, KeyState::Stable(Tier::Warm));

    assert!(controller.delete(&key).await.unwrap());
    assert_eq!(controller.state(&key).await, KeyState::Absent);
    assert!(!controller.delete(&key).await.unwrap());
}

#[tokio::test]
async fn test_offload_toggle_at_runtime() {
    let tmp = TempDir::new().unwrap();
    let controller = build(&tmp, None).await;
    let key = CacheKey::for_request("m", "shadow mode");

    controller.set_offload_disabled(true);
    let put = controller.put(&key, Bytes::from("v"), warm_features()).await;
    assert_eq!(put.tier, Tier::Hot);
    assert_eq!(
        controller.migrate(&key, Tier::Archive).await.unwrap(),
        MigrationStatus::Skipped
    );

    controller.set_offload_disabled(false);
    assert_eq!(
        controller.migrate(&key, Tier::Archive).await.unwrap(),
        MigrationStatus::Migrated {
            from: Tier::Hot,
            to: Tier::Archive
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hit_racing_put_keeps_newer_payload() {
    let tmp = TempDir::new().unwrap();
    let warm = instrumented_warm(&tmp).await;
    let controller = build(&tmp, Some(warm.clone())).await;
    let key = CacheKey::for_request("m", "rewritten");

    let put = controller.put(&key, Bytes::from("OLD"), warm_features()).await;
    assert_eq!(put.tier, Tier::Warm);

    // The lookup reads OLD, then stalls while NEW is written.
    warm.delay_gets(200);
    let racing = {
        let controller = controller.clone();
        let key = key.clone();
        tokio::spawn(async move { controller.lookup(&key).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.put(&key, Bytes::from("NEW"), warm_features()).await;
    assert!(racing.await.unwrap().found);

    warm.delay_gets(0);
    let hit = controller.lookup(&key).await;
    assert_eq!(hit.payload.unwrap(), Bytes::from("NEW"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hit_during_migration_is_not_lost() {
    let tmp = TempDir::new().unwrap();
    let warm = instrumented_warm(&tmp).await;
    let controller = build(&tmp, Some(warm.clone())).await;
    let key = CacheKey::for_request("m", "counted");

    controller.put(&key, Bytes::from("v"), RequestFeatures::default()).await;
    assert_eq!(controller.lookup(&key).await.metadata.unwrap().access_count, 1);

    warm.delay_sets(200);
    let migration = {
        let controller = controller.clone();
        let key = key.clone();
        tokio::spawn(async move { controller.migrate(&key, Tier::Warm).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let hit = controller.lookup(&key).await;
    assert_eq!(hit.tier, Some(Tier::Hot));
    assert_eq!(hit.metadata.unwrap().access_count, 2);

    assert_eq!(
        migration.await.unwrap().unwrap(),
        MigrationStatus::Migrated {
            from: Tier::Hot,
            to: Tier::Warm
        }
    );
    warm.delay_sets(0);

    let hit = controller.lookup(&key).await;
    assert_eq!(hit.tier, Some(Tier::Warm));
    assert_eq!(hit.metadata.unwrap().access_count, 3);
}

#[tokio::test]
async fn test_migrate_retry_clears_leftover_copy() {
    let tmp = TempDir::new().unwrap();
    let warm = instrumented_warm(&tmp).await;
    let controller = build(&tmp, Some(warm.clone())).await;
    let key = CacheKey::for_request("m", "half moved");

    controller.put(&key, Bytes::from("v"), warm_features()).await;
    warm.fail_next_deletes(1);
    assert!(controller.migrate(&key, Tier::Hot).await.is_err());
    assert!(warm.get(&key).await.unwrap().is_some());

    assert_eq!(
        controller.migrate(&key, Tier::Hot).await.unwrap(),
        MigrationStatus::AlreadyInTier
    );
    assert!(warm.get(&key).await.unwrap().is_none());
    assert_eq!(controller.lookup(&key).await.tier, Some(Tier::Hot));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_archive_delete_does_not_block_other_keys() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(SlowDeletes {
        inner: MemoryObjectStore::new(),
        delete_delay_ms: AtomicU64::new(0),
    });
    let controller = build_with(&tmp, None, store.clone()).await;

    // Two keys in the same shard.
    let victim = CacheKey::for_request("m", "0");
    let other = (1..)
        .map(|i| CacheKey::for_request("m", &i.to_string()))
        .find(|k| k.shard() == victim.shard())
        .unwrap();
    controller.put(&victim, Bytes::from("v"), RequestFeatures::default()).await;

    store.delete_delay_ms.store(1_000, Ordering::SeqCst);
    let deleting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.delete(&other).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let hit = controller.lookup(&victim).await;
    assert!(hit.found);
    assert!(started.elapsed() < Duration::from_millis(300));

    deleting.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_rereads_archive_before_computing() {
    let tmp = TempDir::new().unwrap();
    let warm = instrumented_warm(&tmp).await;
    let store = Arc::new(MemoryObjectStore::new());
    let controller = build_with(&tmp, Some(warm.clone()), store.clone()).await;
    let key = CacheKey::for_request("m", "archived late");

    // Each warm read takes 200ms, so the first lookup misses at ~200ms and the
    // leader's own read reaches the archive at ~400ms.
    warm.delay_gets(200);
    let seeder = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let archive = ArchiveTier::new(store, &Config::default().archive);
            let entry = CacheEntry::new(
                key.clone(),
                Bytes::from("archived"),
                EntryMetadata::new(RequestFeatures::default(), unix_millis()),
            );
            archive.set(&key, &entry, Duration::from_secs(3600)).await.unwrap();
        })
    };

    let computed = Arc::new(AtomicBool::new(false));
    let flag = computed.clone();
    let resolved = controller
        .get_or_compute(&key, RequestFeatures::default(), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(Bytes::from("recomputed"))
        })
        .await
        .unwrap();
    seeder.await.unwrap();

    assert!(!computed.load(Ordering::SeqCst));
    assert!(resolved.cached);
    assert_eq!(resolved.payload, Bytes::from("archived"));
    assert_eq!(controller.metrics().upstream_calls.get(), 0);
}

#[tokio::test]
async fn test_sweep_removes_expired_warm_entries() {
    let tmp = TempDir::new().unwrap();
    let warm = Arc::new(WarmTier::open(tmp.path().join("warm")).await.unwrap());
    let controller = build(&tmp, Some(warm.clone())).await;

    let key = CacheKey::for_request("m", "stale on disk");
    let entry = CacheEntry::new(
        key.clone(),
        Bytes::from("v"),
        EntryMetadata::new(RequestFeatures::default(), unix_millis()),
    );
    warm.set(&key, &entry, Duration::from_millis(20)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(controller.sweep().await, 1);
    assert!(warm.is_empty());
    assert!(!tmp
        .path()
        .join("warm")
        .join(key.shard())
        .join(format!("{key}.entry"))
        .exists());
}

#[tokio::test]
async fn test_put_clears_older_archive_copy() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let controller = build_with(&tmp, None, store.clone()).await;
    let key = CacheKey::for_request("m", "replaced");

    let rambling = RequestFeatures {
        perplexity: Some(80.0),
        ..Default::default()
    };
    assert_eq!(controller.put(&key, Bytes::from("old"), rambling).await.tier, Tier::Archive);
    assert_eq!(store.len(), 1);

    let put = controller.put(&key, Bytes::from("new"), RequestFeatures::default()).await;
    assert_eq!(put.tier, Tier::Hot);
    assert!(store.is_empty());

    assert!(controller.delete(&key).await.unwrap());
    assert!(!controller.lookup(&key).await.found);
}
