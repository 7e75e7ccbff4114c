//! Telemetry metric name constants.
//!
//! Centralised metric names for fleetcache operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `fleetcache_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `source` — where a lookup was answered: "local", "store" or "backend"
//! - `mode` — how a lease was taken: "insert" (new record) or "claim"
//! - `status` — outcome: "ok" or "error"

/// Total answered lookups.
///
/// Labels: `source` ("local" | "store" | "backend").
pub const LOOKUPS_TOTAL: &str = "fleetcache_lookups_total";

/// Total fetch leases acquired by this instance.
///
/// Labels: `mode` ("insert" | "claim").
pub const LEASE_ACQUIRED_TOTAL: &str = "fleetcache_lease_acquired_total";

/// Total WAIT decisions (another instance held a live lease).
pub const LEASE_WAITS_TOTAL: &str = "fleetcache_lease_waits_total";

/// Total lost acquisition races (failed conditional update or insert conflict).
pub const LEASE_RACES_TOTAL: &str = "fleetcache_lease_races_total";

/// Total lease releases that could not be written to the store.
pub const LEASE_RELEASE_FAILURES_TOTAL: &str = "fleetcache_lease_release_failures_total";

/// Total backend calls.
///
/// Labels: `status` ("ok" | "error").
pub const BACKEND_REQUESTS_TOTAL: &str = "fleetcache_backend_requests_total";

/// Backend call duration in seconds.
pub const BACKEND_DURATION_SECONDS: &str = "fleetcache_backend_duration_seconds";

/// Backend calls currently holding a limiter slot.
pub const LIMITER_IN_FLIGHT: &str = "fleetcache_limiter_in_flight";

/// Total local-cache entries removed by the cleanup task.
pub const CLEANUP_EVICTED_TOTAL: &str = "fleetcache_cleanup_evicted_total";

/// Total leases cleared by startup recovery.
pub const RECOVERED_LEASES_TOTAL: &str = "fleetcache_recovered_leases_total";
