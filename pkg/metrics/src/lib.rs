use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
    histograms: RwLock<BTreeMap<String, Histogram>>,
}

/// Monotonically increasing counter.
struct Counter {
    value: AtomicU64,
    help: String,
}

/// Value that can go up or down.
struct Gauge {
    value: AtomicI64,
    help: String,
}

/// Latency distribution over fixed upper bounds (seconds).
struct Histogram {
    bounds: Vec<f64>,
    /// One slot per bound; the implicit `+Inf` bucket is `count`.
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum of observations in microseconds.
    sum_micros: AtomicU64,
    help: String,
}

/// Exponential buckets from 1ms to ~16s, suited to rule-sync latency.
pub const SYNC_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096,
    8.192, 16.384,
];

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.entry(name.to_string()).or_insert_with(|| Counter {
            value: AtomicU64::new(0),
            help: help.to_string(),
        });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        gauges.entry(name.to_string()).or_insert_with(|| Gauge {
            value: AtomicI64::new(0),
            help: help.to_string(),
        });
    }

    /// Register a histogram with ascending upper bounds in seconds.
    pub fn register_histogram(&self, name: &str, help: &str, bounds: &[f64]) {
        let mut histograms = self.histograms.write().unwrap_or_else(PoisonError::into_inner);
        histograms.entry(name.to_string()).or_insert_with(|| Histogram {
            bounds: bounds.to_vec(),
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            help: help.to_string(),
        });
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = counters.get(name) {
            c.value.fetch_add(val, Ordering::Relaxed);
        }
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(g) = gauges.get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    /// Record one duration into a histogram.
    pub fn observe(&self, name: &str, elapsed: Duration) {
        let histograms = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
        let Some(h) = histograms.get(name) else {
            return;
        };
        let secs = elapsed.as_secs_f64();
        for (bound, bucket) in h.bounds.iter().zip(&h.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        h.count.fetch_add(1, Ordering::Relaxed);
        h.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Current counter value, if registered.
    pub fn counter_value(&self, name: &str) -> Option<u64> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters.get(name).map(|c| c.value.load(Ordering::Relaxed))
    }

    /// Current gauge value, if registered.
    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        gauges.get(name).map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Number of observations recorded by a histogram, if registered.
    pub fn histogram_count(&self, name: &str) -> Option<u64> {
        let histograms = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
        histograms.get(name).map(|h| h.count.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        for (name, counter) in counters.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, counter.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                counter.value.load(Ordering::Relaxed)
            ));
        }

        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        for (name, gauge) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, gauge.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                gauge.value.load(Ordering::Relaxed)
            ));
        }

        let histograms = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
        for (name, h) in histograms.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, h.help));
            output.push_str(&format!("# TYPE {} histogram\n", name));
            for (bound, bucket) in h.bounds.iter().zip(&h.buckets) {
                output.push_str(&format!(
                    "{}_bucket{{le=\"{}\"}} {}\n",
                    name,
                    bound,
                    bucket.load(Ordering::Relaxed)
                ));
            }
            let count = h.count.load(Ordering::Relaxed);
            output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, count));
            output.push_str(&format!(
                "{}_sum {}\n",
                name,
                h.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
            ));
            output.push_str(&format!("{}_count {}\n", name, count));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
