//! End-to-end tests for `CacheProxy`.
//!
//! A fleet is simulated by several proxies with distinct identities sharing
//! one `InMemoryRecordStore` and one `ManualClock`. Tokio time is paused so
//! backend latency and wait backoff cost no real time; lease and TTL expiry
//! move only when the manual clock is advanced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::time::Instant;

use fleetcache::{
    Backend, CacheProxy, CacheRecord, FailurePolicy, Filter, FleetCacheError, InMemoryRecordStore,
    InstanceId, Lease, LeaseCoordinator, LeaseDecision, ManualClock, ProxyConfig, RecordStore,
    RequestContext, Result, WaitBackoff, cancel_pair,
};

const TTL: Duration = Duration::from_secs(10);
const LEASE: Duration = Duration::from_secs(5);

// ============================================================================
// Mock backend
// ============================================================================

/// Backend that sleeps, counts calls and tracks how many run at once.
///
/// Payloads are `"{key}:{call number}"` so tests can tell fetches apart.
struct CountingBackend {
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    failing: AtomicBool,
}

impl CountingBackend {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

/// Decrements the active count even when the fetch future is dropped.
struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = Active(&self.active);

        tokio::time::sleep(self.delay).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(FleetCacheError::Backend("backend exploded".to_string()));
        }
        Ok(format!("{key}:{n}").into_bytes())
    }
}

// ============================================================================
// Fleet helpers
// ============================================================================

struct Fleet {
    store: Arc<InMemoryRecordStore>,
    clock: Arc<ManualClock>,
    backend: Arc<CountingBackend>,
}

impl Fleet {
    fn new(latency: Duration) -> Self {
        Self {
            store: Arc::new(InMemoryRecordStore::new()),
            clock: Arc::new(ManualClock::starting_now()),
            backend: Arc::new(CountingBackend::new(latency)),
        }
    }

    async fn proxy(&self, id: &str) -> Arc<CacheProxy> {
        self.proxy_with(id, config()).await
    }

    async fn proxy_with(&self, id: &str, config: ProxyConfig) -> Arc<CacheProxy> {
        let proxy = CacheProxy::builder()
            .config(config)
            .store(Arc::clone(&self.store))
            .backend(Arc::clone(&self.backend))
            .clock(Arc::clone(&self.clock))
            .instance_id(id)
            .build()
            .await
            .unwrap();
        Arc::new(proxy)
    }

    /// Take the lease for `key` as `owner` and never finish, like a crashed
    /// instance.
    async fn abandon_lease(&self, owner: &str, key: &str) -> Lease {
        let coordinator = LeaseCoordinator::new(
            self.store.clone(),
            self.clock.clone(),
            InstanceId::new(owner),
            LEASE,
            TTL,
        );
        match coordinator.decide(key).await.unwrap() {
            LeaseDecision::Acquire(lease) => lease,
            other => panic!("expected to acquire {key}, got {other:?}"),
        }
    }

    async fn record(&self, key: &str) -> CacheRecord {
        self.store
            .find(&[Filter::Key(key.to_string())])
            .await
            .unwrap()
            .pop()
            .expect("record exists")
    }
}

fn config() -> ProxyConfig {
    ProxyConfig::new()
        .backend_timeout(Duration::from_secs(2))
        .cache_ttl(TTL)
        .lease_timeout(LEASE)
        .max_concurrency(2)
        .max_wait_budget(Duration::from_secs(4))
        .wait_backoff(
            WaitBackoff::new()
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_millis(200)),
        )
}

// ============================================================================
// Single-flight
// ============================================================================

#[tokio::test(start_paused = true)]
async fn five_callers_on_three_instances_share_one_fetch() {
    let fleet = Fleet::new(Duration::from_secs(1));
    let proxies = [
        fleet.proxy("a").await,
        fleet.proxy("b").await,
        fleet.proxy("c").await,
    ];

    let started = Instant::now();
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let proxy = Arc::clone(&proxies[i % proxies.len()]);
            tokio::spawn(async move { proxy.get_resource("x").await })
        })
        .collect();
    let bodies: Vec<Vec<u8>> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(fleet.backend.calls(), 1);
    assert!(bodies.iter().all(|body| body == b"x:1"));
    // Latency plus a backoff step or two, not five sequential fetches.
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_instances_never_overlap_fetches() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let mut proxies = Vec::new();
    for i in 0..4 {
        proxies.push(fleet.proxy(&format!("node-{i}")).await);
    }

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let proxy = Arc::clone(&proxies[i % proxies.len()]);
            tokio::spawn(async move { proxy.get_resource("hot").await })
        })
        .collect();
    for joined in join_all(tasks).await {
        assert_eq!(joined.unwrap().unwrap(), b"hot:1");
    }

    assert_eq!(fleet.backend.calls(), 1);
    assert_eq!(fleet.backend.max_active(), 1);
}

// ============================================================================
// Cache hits and expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn hits_within_ttl_never_reach_backend() {
    let fleet = Fleet::new(Duration::from_millis(200));
    let a = fleet.proxy("a").await;
    let b = fleet.proxy("b").await;

    assert_eq!(a.get_resource("k").await.unwrap(), b"k:1");
    fleet.clock.advance(TTL - Duration::from_secs(1));

    for _ in 0..5 {
        assert_eq!(a.get_resource("k").await.unwrap(), b"k:1");
        assert_eq!(b.get_resource("k").await.unwrap(), b"k:1");
    }
    assert_eq!(fleet.backend.calls(), 1);
    // b filled its local cache from the store.
    assert_eq!(b.local_cache().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_value_is_refetched_once() {
    let fleet = Fleet::new(Duration::from_millis(500));
    let a = fleet.proxy("a").await;
    let b = fleet.proxy("b").await;

    assert_eq!(a.get_resource("k").await.unwrap(), b"k:1");
    fleet.clock.advance(TTL);

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let proxy = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            tokio::spawn(async move { proxy.get_resource("k").await })
        })
        .collect();
    for joined in join_all(tasks).await {
        assert_eq!(joined.unwrap().unwrap(), b"k:2");
    }
    assert_eq!(fleet.backend.calls(), 2);
}

// ============================================================================
// Lease recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn abandoned_lease_is_taken_over_after_expiry() {
    let fleet = Fleet::new(Duration::from_millis(100));
    fleet.abandon_lease("crashed", "k").await;
    let proxy = fleet.proxy("survivor").await;

    let waiting = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.get_resource("k").await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiting.is_finished(), "must wait while the lease is live");
    assert_eq!(fleet.backend.calls(), 0);

    fleet.clock.advance(LEASE + Duration::from_secs(1));

    assert_eq!(waiting.await.unwrap().unwrap(), b"k:1");
    assert_eq!(fleet.backend.calls(), 1);

    let record = fleet.record("k").await;
    assert!(!record.in_progress);
    assert!(record.lock_token.is_none());
}

#[tokio::test(start_paused = true)]
async fn restart_clears_own_leftover_lease() {
    let fleet = Fleet::new(Duration::from_millis(100));
    fleet.abandon_lease("node-1", "mine").await;
    fleet.abandon_lease("node-2", "theirs").await;

    // Same identity as the crashed run; its lease is still within timeout.
    let proxy = fleet.proxy("node-1").await;

    let record = fleet.record("mine").await;
    assert!(!record.in_progress);
    assert!(record.lock_token.is_none());
    assert!(fleet.record("theirs").await.in_progress);

    let started = Instant::now();
    assert_eq!(proxy.get_resource("mine").await.unwrap(), b"mine:1");
    assert!(started.elapsed() <= Duration::from_millis(150), "acquired without waiting");
}

#[tokio::test(start_paused = true)]
async fn aborted_call_releases_its_lease() {
    let fleet = Fleet::new(Duration::from_secs(1));
    let a = fleet.proxy("a").await;
    let b = fleet.proxy("b").await;

    let fetching = {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.get_resource("k").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fleet.record("k").await.is_held_by(a.instance_id()));

    fetching.abort();
    assert!(fetching.await.unwrap_err().is_cancelled());
    // Let the spawned release run.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let record = fleet.record("k").await;
    assert!(!record.in_progress);
    assert!(record.lock_token.is_none());

    assert_eq!(b.get_resource("k").await.unwrap(), b"k:2");
}

// ============================================================================
// Concurrency limiter
// ============================================================================

#[tokio::test(start_paused = true)]
async fn limiter_caps_simultaneous_backend_calls() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let proxy = fleet.proxy("a").await;

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.get_resource(&format!("key-{i}")).await })
        })
        .collect();
    for joined in join_all(tasks).await {
        joined.unwrap().unwrap();
    }

    assert_eq!(fleet.backend.calls(), 6);
    assert_eq!(fleet.backend.max_active(), 2);
    assert_eq!(proxy.limiter().in_flight(), 0);
}

// ============================================================================
// Cancellation and deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancel_while_waiting_leaves_record_intact() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let lease = fleet.abandon_lease("peer", "k").await;
    let proxy = fleet.proxy("a").await;

    let (handle, signal) = cancel_pair();
    let waiting = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let ctx = RequestContext::background().with_cancel(signal);
            proxy.get_resource_with(&ctx, "k").await
        })
    };
    tokio::time::sleep(Duration::from_millis(250)).await;

    let cancelled_at = Instant::now();
    handle.cancel();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, FleetCacheError::Cancelled));
    assert!(cancelled_at.elapsed() < Duration::from_millis(50));

    let record = fleet.record("k").await;
    assert!(record.is_held_by(&lease.owner));
    assert_eq!(fleet.backend.calls(), 0);

    // Once the peer's lease lapses a normal call goes through.
    fleet.clock.advance(LEASE);
    assert_eq!(proxy.get_resource("k").await.unwrap(), b"k:1");
}

#[tokio::test(start_paused = true)]
async fn deadline_while_waiting() {
    let fleet = Fleet::new(Duration::from_millis(100));
    fleet.abandon_lease("peer", "k").await;
    let proxy = fleet.proxy("a").await;

    let ctx = RequestContext::background().with_timeout(Duration::from_millis(300));
    let err = proxy.get_resource_with(&ctx, "k").await.unwrap_err();
    assert!(matches!(err, FleetCacheError::DeadlineExceeded));
    assert!(err.is_cancellation());
}

/// Store whose reads hang once `stall` is set.
struct HangingStore {
    inner: Arc<InMemoryRecordStore>,
    stall: AtomicBool,
}

#[async_trait]
impl RecordStore for HangingStore {
    async fn insert(&self, record: CacheRecord) -> Result<fleetcache::RecordId> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: &fleetcache::RecordId) -> Result<Option<CacheRecord>> {
        self.inner.get(id).await
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<CacheRecord>> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.find(filters).await
    }

    async fn update(&self, id: &fleetcache::RecordId, record: CacheRecord) -> Result<()> {
        self.inner.update(id, record).await
    }

    async fn compare_and_update(
        &self,
        id: &fleetcache::RecordId,
        record: CacheRecord,
        expected_token: Option<&InstanceId>,
    ) -> Result<bool> {
        self.inner.compare_and_update(id, record, expected_token).await
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_while_store_read_hangs() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let store = Arc::new(HangingStore {
        inner: Arc::clone(&fleet.store),
        stall: AtomicBool::new(false),
    });
    let proxy = CacheProxy::builder()
        .config(config())
        .store(Arc::clone(&store))
        .backend(Arc::clone(&fleet.backend))
        .clock(Arc::clone(&fleet.clock))
        .instance_id("a")
        .build()
        .await
        .unwrap();

    store.stall.store(true, Ordering::SeqCst);
    let started = Instant::now();
    let ctx = RequestContext::background().with_timeout(Duration::from_millis(300));
    let err = proxy.get_resource_with(&ctx, "k").await.unwrap_err();
    assert!(matches!(err, FleetCacheError::DeadlineExceeded), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(fleet.backend.calls(), 0);
    assert!(fleet.store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_fetch_releases_lease() {
    let fleet = Fleet::new(Duration::from_secs(1));
    let proxy = fleet.proxy("a").await;

    let (handle, signal) = cancel_pair();
    let fetching = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let ctx = RequestContext::background().with_cancel(signal);
            proxy.get_resource_with(&ctx, "k").await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.backend.calls(), 1);

    handle.cancel();
    let err = fetching.await.unwrap().unwrap_err();
    assert!(matches!(err, FleetCacheError::Cancelled));

    let record = fleet.record("k").await;
    assert!(!record.in_progress);
    assert!(record.value.is_empty());
    assert_eq!(proxy.limiter().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn wait_budget_exhausted_behind_peer() {
    let fleet = Fleet::new(Duration::from_millis(100));
    fleet.abandon_lease("slow-peer", "k").await;
    let proxy = fleet
        .proxy_with("a", config().max_wait_budget(Duration::from_millis(500)))
        .await;

    let started = Instant::now();
    let err = proxy.get_resource("k").await.unwrap_err();
    match err {
        FleetCacheError::LeaseWaitTimeout { key, waited } => {
            assert_eq!(key, "k");
            assert!(waited >= Duration::from_millis(500));
        }
        other => panic!("expected LeaseWaitTimeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(fleet.backend.calls(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn backend_error_keeps_previous_value_by_default() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let proxy = fleet.proxy("a").await;

    assert_eq!(proxy.get_resource("k").await.unwrap(), b"k:1");
    fleet.clock.advance(TTL);

    fleet.backend.set_failing(true);
    let err = proxy.get_resource("k").await.unwrap_err();
    assert!(matches!(err, FleetCacheError::Backend(_)));
    assert!(err.is_backend());

    let record = fleet.record("k").await;
    assert!(!record.in_progress);
    assert!(record.lock_token.is_none());
    assert_eq!(record.value, b"k:1");

    fleet.backend.set_failing(false);
    assert_eq!(proxy.get_resource("k").await.unwrap(), b"k:3");
}

#[tokio::test(start_paused = true)]
async fn clear_stale_policy_drops_expired_value_on_error() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let proxy = fleet
        .proxy_with("a", config().failure_policy(FailurePolicy::ClearStale))
        .await;

    proxy.get_resource("k").await.unwrap();
    fleet.clock.advance(TTL);
    fleet.backend.set_failing(true);
    proxy.get_resource("k").await.unwrap_err();

    let record = fleet.record("k").await;
    assert!(record.value.is_empty());
    assert!(record.expires_at.is_none());
    assert!(!record.in_progress);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out_and_releases() {
    let fleet = Fleet::new(Duration::from_secs(3));
    let proxy = fleet
        .proxy_with("a", config().backend_timeout(Duration::from_secs(1)))
        .await;

    let err = proxy.get_resource("k").await.unwrap_err();
    assert!(matches!(
        err,
        FleetCacheError::BackendTimeout { timeout } if timeout == Duration::from_secs(1)
    ));
    assert!(!fleet.record("k").await.in_progress);
}

#[tokio::test(start_paused = true)]
async fn store_outage_surfaces_but_local_hits_still_serve() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let proxy = fleet.proxy("a").await;

    assert_eq!(proxy.get_resource("warm").await.unwrap(), b"warm:1");
    fleet.store.set_available(false);

    assert_eq!(proxy.get_resource("warm").await.unwrap(), b"warm:1");

    let err = proxy.get_resource("cold").await.unwrap_err();
    assert!(err.is_store(), "got {err:?}");
    assert_eq!(fleet.backend.calls(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_closes_limiter_but_serves_cached_values() {
    let fleet = Fleet::new(Duration::from_millis(100));
    let proxy = fleet.proxy("a").await;

    proxy.get_resource("warm").await.unwrap();
    proxy.shutdown().await;
    assert!(proxy.limiter().is_closed());

    assert_eq!(proxy.get_resource("warm").await.unwrap(), b"warm:1");

    let err = proxy.get_resource("cold").await.unwrap_err();
    assert!(matches!(err, FleetCacheError::LimiterClosed));
    assert!(!fleet.record("cold").await.in_progress);

    // A second shutdown is harmless.
    proxy.shutdown().await;
}

#[tokio::test]
async fn build_requires_store_and_backend() {
    let err = CacheProxy::builder()
        .backend(Arc::new(CountingBackend::new(Duration::ZERO)))
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetCacheError::Configuration(_)));

    let err = CacheProxy::builder()
        .store(Arc::new(InMemoryRecordStore::new()))
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetCacheError::Configuration(_)));
}

#[tokio::test]
async fn build_rejects_lease_shorter_than_backend_timeout() {
    let err = CacheProxy::builder()
        .config(
            config()
                .backend_timeout(Duration::from_secs(5))
                .lease_timeout(Duration::from_secs(5)),
        )
        .store(Arc::new(InMemoryRecordStore::new()))
        .backend(Arc::new(CountingBackend::new(Duration::ZERO)))
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FleetCacheError::Configuration(_)));
}

#[tokio::test]
async fn generated_identities_are_distinct() {
    let store = Arc::new(InMemoryRecordStore::new());
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let build = || {
        CacheProxy::builder()
            .store(Arc::clone(&store))
            .backend(Arc::clone(&backend))
            .build()
    };
    let a = build().await.unwrap();
    let b = build().await.unwrap();
    assert_ne!(a.instance_id(), b.instance_id());
}
