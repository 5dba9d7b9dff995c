//! Sync scheduling and service defaults.

/// Minimum time between two rule syncs, in seconds.
pub const DEFAULT_MIN_SYNC_PERIOD_SECS: u64 = 1;

/// Forced resync period, in seconds.
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 30;

/// Syncs allowed back-to-back before the minimum period applies.
pub const DEFAULT_BURST_SYNCS: u32 = 2;

/// How often the event source polls the API server, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// ClientIP session affinity timeout when the Service does not set one.
pub const DEFAULT_CLIENT_IP_AFFINITY_SECS: u32 = 10800;

/// Name given to the sync runner in logs.
pub const SYNC_RUNNER_NAME: &str = "sync-runner";
