//! Bounded-frequency runner.
//!
//! Runs a function no more often than every `min_interval` (after an initial
//! burst) and at least every `max_interval`. Requests made while throttled
//! collapse into one deferred run.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Floor for throttled retries. Refill can land a few ULPs short of a
/// whole token at the interval boundary.
const MIN_RETRY: Duration = Duration::from_millis(1);

/// Token bucket refilling one token per `min_interval`.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens per second; zero disables limiting.
    rate: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(min_interval: Duration, burst: u32, now: Instant) -> Self {
        let rate = if min_interval.is_zero() {
            0.0
        } else {
            1.0 / min_interval.as_secs_f64()
        };
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            rate,
            last: now,
        }
    }

    fn try_accept(&mut self, now: Instant) -> bool {
        if self.rate == 0.0 {
            return true;
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available, never less than 1ms.
    fn next_token_in(&self) -> Duration {
        if self.rate == 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens).max(0.0) / self.rate).max(MIN_RETRY)
    }
}

pub struct BoundedFrequencyRunner {
    name: String,
    min_interval: Duration,
    max_interval: Duration,
    burst: u32,
    notify: Notify,
}

impl BoundedFrequencyRunner {
    pub fn new(
        name: &str,
        min_interval: Duration,
        max_interval: Duration,
        burst: u32,
    ) -> anyhow::Result<Self> {
        if max_interval < min_interval {
            anyhow::bail!(
                "{}: max interval ({:?}) must be >= min interval ({:?})",
                name,
                max_interval,
                min_interval
            );
        }
        Ok(Self {
            name: name.to_string(),
            min_interval,
            max_interval,
            burst,
            notify: Notify::new(),
        })
    }

    /// Request a run. Never blocks; requests made before the loop picks one
    /// up are merged.
    pub fn run(&self) {
        self.notify.notify_one();
    }

    /// Drive `f` until `shutdown` flips to `true`. A run in progress is
    /// always finished before the loop exits.
    pub async fn run_loop<F, Fut>(&self, mut f: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        info!("{} loop running", self.name);
        let now = Instant::now();
        let mut limiter = TokenBucket::new(self.min_interval, self.burst, now);
        let mut last_run = now;
        let mut deadline = now + self.max_interval;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("{} loop stopping", self.name);
                        return;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.notify.notified() => {}
            }

            let now = Instant::now();
            if limiter.try_accept(now) {
                f().await;
                last_run = Instant::now();
                deadline = last_run + self.max_interval;
                continue;
            }

            // Throttled: come back when the next token is due, unless the
            // forced resync is sooner anyway.
            let elapsed = now.saturating_duration_since(last_run);
            let next_possible = limiter.next_token_in();
            let next_scheduled = self.max_interval.saturating_sub(elapsed);
            if next_possible < next_scheduled {
                debug!("{}: throttled, retrying in {:?}", self.name, next_possible);
                deadline = now + next_possible;
            }
        }
    }
}
