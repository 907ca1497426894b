//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `wallet_credits_total` - Credits applied
//! - `wallet_debits_total` - Debits applied
//! - `wallet_replays_total` - Idempotent replays (no state change)
//! - `wallet_rejections_total` - Mutations rejected by a business rule
//! - `wallet_mutation_duration_seconds` - Histogram of mutation latencies
//!
//! Counters live in a per-instance `Registry` rather than the process-wide
//! default, so multiple wallets in one process do not collide.

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Credits applied
    pub credits_total: IntCounter,

    /// Debits applied
    pub debits_total: IntCounter,

    /// Idempotent replays
    pub replays_total: IntCounter,

    /// Business-rule rejections (insufficient funds, invalid amount)
    pub rejections_total: IntCounter,

    /// Mutation duration histogram
    pub mutation_duration: Histogram,

    /// Prometheus registry
    registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let credits_total =
            IntCounter::new("wallet_credits_total", "Credits applied")?;
        registry.register(Box::new(credits_total.clone()))?;

        let debits_total = IntCounter::new("wallet_debits_total", "Debits applied")?;
        registry.register(Box::new(debits_total.clone()))?;

        let replays_total = IntCounter::new(
            "wallet_replays_total",
            "Idempotent replays (no state change)",
        )?;
        registry.register(Box::new(replays_total.clone()))?;

        let rejections_total = IntCounter::new(
            "wallet_rejections_total",
            "Mutations rejected by a business rule",
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let mutation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wallet_mutation_duration_seconds",
                "Histogram of mutation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(mutation_duration.clone()))?;

        Ok(Self {
            credits_total,
            debits_total,
            replays_total,
            rejections_total,
            mutation_duration,
            registry,
        })
    }

    /// Record an applied credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record an applied debit
    pub fn record_debit(&self) {
        self.debits_total.inc();
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record a business-rule rejection
    pub fn record_rejection(&self) {
        self.rejections_total.inc();
    }

    /// Record mutation duration
    pub fn record_mutation_duration(&self, duration_seconds: f64) {
        self.mutation_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.credits_total.get(), 0);
        assert_eq!(metrics.debits_total.get(), 0);
    }

    #[test]
    fn test_two_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.record_credit();
        assert_eq!(a.credits_total.get(), 1);
        assert_eq!(b.credits_total.get(), 0);
    }

    #[test]
    fn test_record_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_credit();
        metrics.record_debit();
        metrics.record_debit();
        metrics.record_replay();
        metrics.record_rejection();

        assert_eq!(metrics.credits_total.get(), 1);
        assert_eq!(metrics.debits_total.get(), 2);
        assert_eq!(metrics.replays_total.get(), 1);
        assert_eq!(metrics.rejections_total.get(), 1);
    }

    #[test]
    fn test_registry_gather() {
        let metrics = Metrics::new().unwrap();
        metrics.record_mutation_duration(0.002);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "wallet_mutation_duration_seconds"));
    }
}
