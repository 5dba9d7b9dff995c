//! Sync health as served on `/healthz`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
struct Stamps {
    last_queued: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
}

/// Tracks when a sync was last requested and when one last succeeded.
///
/// The proxy is unhealthy once a requested sync has been outstanding for
/// longer than the timeout with no successful sync since.
#[derive(Debug)]
pub struct HealthState {
    timeout: ChronoDuration,
    stamps: Mutex<Stamps>,
}

impl HealthState {
    /// `sync_period` is the forced resync period; the timeout is twice that.
    pub fn new(sync_period: Duration) -> Self {
        let timeout = ChronoDuration::from_std(sync_period * 2).unwrap_or(ChronoDuration::MAX);
        Self {
            timeout,
            stamps: Mutex::new(Stamps::default()),
        }
    }

    fn stamps(&self) -> std::sync::MutexGuard<'_, Stamps> {
        self.stamps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queued_update(&self) {
        self.queued_update_at(Utc::now());
    }

    pub fn queued_update_at(&self, at: DateTime<Utc>) {
        self.stamps().last_queued = Some(at);
    }

    pub fn updated(&self) {
        self.updated_at(Utc::now());
    }

    pub fn updated_at(&self, at: DateTime<Utc>) {
        self.stamps().last_updated = Some(at);
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.stamps().last_updated
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let stamps = *self.stamps();
        let Some(queued) = stamps.last_queued else {
            return true;
        };
        if stamps.last_updated.is_some_and(|u| u >= queued) {
            return true;
        }
        queued
            .checked_add_signed(self.timeout)
            .is_none_or(|deadline| now <= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_until_queued_update_times_out() {
        let health = HealthState::new(Duration::from_secs(30));
        let t0 = Utc::now();
        assert!(health.is_healthy_at(t0));

        health.queued_update_at(t0);
        assert!(health.is_healthy_at(t0 + ChronoDuration::seconds(59)));
        assert!(!health.is_healthy_at(t0 + ChronoDuration::seconds(61)));

        health.updated_at(t0 + ChronoDuration::seconds(62));
        assert!(health.is_healthy_at(t0 + ChronoDuration::seconds(300)));
        assert_eq!(health.last_updated(), Some(t0 + ChronoDuration::seconds(62)));
    }

    #[test]
    fn stale_update_does_not_count() {
        let health = HealthState::new(Duration::from_secs(1));
        let t0 = Utc::now();
        health.updated_at(t0);
        health.queued_update_at(t0 + ChronoDuration::seconds(1));
        assert!(!health.is_healthy_at(t0 + ChronoDuration::seconds(10)));
    }
}
