//! Process-local operational counters, surfaced on the health endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde_json::{Value, json};

#[derive(Default)]
pub struct Metrics {
    /// Gauge: pending payments older than the reconciliation threshold.
    pub pending_over_15m_count: AtomicI64,
    pub reconcile_corrections: AtomicU64,
    pub reconcile_failures: AtomicU64,
    pub events_dropped: AtomicU64,
    pub webhooks_delivered: AtomicU64,
    pub webhooks_failed: AtomicU64,
    pub payout_transfers_completed: AtomicU64,
    pub payout_transfers_failed: AtomicU64,
    pub idempotent_replays: AtomicU64,
    pub rate_limited_requests: AtomicU64,
    pub entitlements_expired: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> Value {
        json!({
            "pending_over_15m_count": self.pending_over_15m_count.load(Ordering::Relaxed),
            "reconcile_corrections": self.reconcile_corrections.load(Ordering::Relaxed),
            "reconcile_failures": self.reconcile_failures.load(Ordering::Relaxed),
            "events_dropped": self.events_dropped.load(Ordering::Relaxed),
            "webhooks_delivered": self.webhooks_delivered.load(Ordering::Relaxed),
            "webhooks_failed": self.webhooks_failed.load(Ordering::Relaxed),
            "payout_transfers_completed": self.payout_transfers_completed.load(Ordering::Relaxed),
            "payout_transfers_failed": self.payout_transfers_failed.load(Ordering::Relaxed),
            "idempotent_replays": self.idempotent_replays.load(Ordering::Relaxed),
            "rate_limited_requests": self.rate_limited_requests.load(Ordering::Relaxed),
            "entitlements_expired": self.entitlements_expired.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_updates() {
        let metrics = Metrics::default();
        metrics.reconcile_corrections.fetch_add(3, Ordering::Relaxed);
        metrics.pending_over_15m_count.store(7, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["reconcile_corrections"], 3);
        assert_eq!(snapshot["pending_over_15m_count"], 7);
    }
}
