//! Proxy metric names.

use pkg_metrics::{MetricsRegistry, SYNC_LATENCY_BUCKETS};

pub const SYNC_PROXY_RULES_DURATION: &str = "sync_proxy_rules_duration_seconds";
pub const SYNC_PROXY_RULES_TOTAL: &str = "sync_proxy_rules_total";
pub const SYNC_PROXY_RULES_FAILURES: &str = "sync_proxy_rules_failures_total";
pub const SYNC_PROXY_RULES_LAST_TIMESTAMP: &str = "sync_proxy_rules_last_timestamp_seconds";
pub const PROXY_SERVICES: &str = "proxy_services";
pub const PROXY_ENDPOINTS: &str = "proxy_endpoints";

/// Register every proxy metric with `registry`.
pub fn register(registry: &MetricsRegistry) {
    registry.register_histogram(
        SYNC_PROXY_RULES_DURATION,
        "Latency of one iptables rule sync",
        SYNC_LATENCY_BUCKETS,
    );
    registry.register_counter(SYNC_PROXY_RULES_TOTAL, "Rule syncs attempted");
    registry.register_counter(SYNC_PROXY_RULES_FAILURES, "Rule syncs that failed");
    registry.register_gauge(
        SYNC_PROXY_RULES_LAST_TIMESTAMP,
        "Unix time of the last successful rule sync",
    );
    registry.register_gauge(PROXY_SERVICES, "Service ports programmed");
    registry.register_gauge(PROXY_ENDPOINTS, "Endpoints programmed");
}
