//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `fraud_evaluations_total` - Evaluations completed
//! - `fraud_decisions_total{decision}` - Final decisions by outcome
//! - `fraud_degraded_evaluations_total` - Evaluations missing a dependency
//! - `fraud_alerts_opened_total` / `fraud_alerts_resolved_total` - Alert lifecycle
//! - `fraud_effect_failures_total` - Side effects that could not be applied
//! - `fraud_evaluation_duration_seconds` - Evaluation latency

use crate::Decision;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Evaluations completed
    pub evaluations_total: IntCounter,

    /// Decisions by outcome
    pub decisions_total: IntCounterVec,

    /// Degraded evaluations
    pub degraded_total: IntCounter,

    /// Alerts opened
    pub alerts_opened: IntCounter,

    /// Alerts resolved
    pub alerts_resolved: IntCounter,

    /// Effects that failed to apply
    pub effect_failures: IntCounter,

    /// Evaluation latency
    pub evaluation_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector on a private registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let evaluations_total = IntCounter::new("fraud_evaluations_total", "Evaluations completed")?;
        registry.register(Box::new(evaluations_total.clone()))?;

        let decisions_total = IntCounterVec::new(
            Opts::new("fraud_decisions_total", "Final decisions by outcome"),
            &["decision"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let degraded_total = IntCounter::new(
            "fraud_degraded_evaluations_total",
            "Evaluations computed with a dependency unavailable",
        )?;
        registry.register(Box::new(degraded_total.clone()))?;

        let alerts_opened = IntCounter::new("fraud_alerts_opened_total", "Alerts opened")?;
        registry.register(Box::new(alerts_opened.clone()))?;

        let alerts_resolved = IntCounter::new("fraud_alerts_resolved_total", "Alerts resolved")?;
        registry.register(Box::new(alerts_resolved.clone()))?;

        let effect_failures = IntCounter::new(
            "fraud_effect_failures_total",
            "Side effects that could not be applied",
        )?;
        registry.register(Box::new(effect_failures.clone()))?;

        let evaluation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fraud_evaluation_duration_seconds",
                "Histogram of evaluation latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100]),
        )?;
        registry.register(Box::new(evaluation_duration.clone()))?;

        Ok(Self {
            evaluations_total,
            decisions_total,
            degraded_total,
            alerts_opened,
            alerts_resolved,
            effect_failures,
            evaluation_duration,
            registry,
        })
    }

    /// Record a finished evaluation
    pub fn record_evaluation(&self, decision: Decision, degraded: bool, duration_seconds: f64) {
        self.evaluations_total.inc();
        self.decisions_total.with_label_values(&[decision.as_str()]).inc();
        if degraded {
            self.degraded_total.inc();
        }
        self.evaluation_duration.observe(duration_seconds);
    }

    /// Record an opened alert
    pub fn record_alert_opened(&self) {
        self.alerts_opened.inc();
    }

    /// Record a resolved alert
    pub fn record_alert_resolved(&self) {
        self.alerts_resolved.inc();
    }

    /// Record a failed side effect
    pub fn record_effect_failure(&self) {
        self.effect_failures.inc();
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
        assert_eq!(metrics.evaluations_total.get(), 0);
        assert_eq!(metrics.alerts_opened.get(), 0);

        // Private registries do not collide
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_evaluation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_evaluation(Decision::Allow, false, 0.001);
        metrics.record_evaluation(Decision::Review, true, 0.002);

        assert_eq!(metrics.evaluations_total.get(), 2);
        assert_eq!(metrics.degraded_total.get(), 1);
        assert_eq!(
            metrics.decisions_total.with_label_values(&["review"]).get(),
            1
        );
    }

    #[test]
    fn test_registry_gathers() {
        let metrics = Metrics::new().unwrap();
        metrics.record_alert_opened();
        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "fraud_alerts_opened_total"));
    }
}
