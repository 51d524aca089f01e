//! Engine metrics: rule runs, async staleness, ownership rejections, saves.
//!
//! Everything goes through the `metrics` facade. No recorder is installed
//! here; without one the calls are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use trellis_core::telemetry::metrics::{describe_engine_metrics, RuleMetrics};
//!
//! describe_engine_metrics();
//! RuleMetrics::run("validation", "sync");
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::sync::Once;
use std::time::Instant;

static DESCRIBE: Once = Once::new();

/// Register descriptions for every engine metric. Safe to call repeatedly.
pub fn describe_engine_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!("trellis_errors_total", "Total engine errors by code");

        describe_counter!("trellis_rule_runs_total", "Rule executions by kind and mode");
        describe_counter!(
            "trellis_async_rule_stale_total",
            "Async rule results discarded because a newer run started"
        );
        describe_counter!(
            "trellis_async_rule_timeouts_total",
            "Async rule runs that exceeded the configured timeout"
        );
        describe_counter!(
            "trellis_cascade_limit_total",
            "Writes refused because the cascade depth limit was reached"
        );

        describe_counter!(
            "trellis_ownership_rejections_total",
            "Collection attaches rejected by ownership checks"
        );

        describe_counter!("trellis_saves_total", "Save operations by route and outcome");
        describe_histogram!("trellis_save_duration_seconds", "Save duration in seconds");
    });
}

/// Rule execution counters.
pub struct RuleMetrics;

impl RuleMetrics {
    /// Count one rule execution.
    pub fn run(kind: &'static str, mode: &'static str) {
        counter!("trellis_rule_runs_total", "kind" => kind, "mode" => mode).increment(1);
    }

    /// Count one discarded stale async result.
    pub fn stale(rule: &str) {
        counter!("trellis_async_rule_stale_total", "rule" => rule.to_string()).increment(1);
    }

    /// Count one async rule timeout.
    pub fn timeout(rule: &str) {
        counter!("trellis_async_rule_timeouts_total", "rule" => rule.to_string()).increment(1);
    }

    /// Count one refused cascade.
    pub fn cascade_limit() {
        counter!("trellis_cascade_limit_total").increment(1);
    }
}

/// Ownership rejection counter.
pub struct OwnershipMetrics;

impl OwnershipMetrics {
    pub fn rejected(reason: &'static str) {
        counter!("trellis_ownership_rejections_total", "reason" => reason).increment(1);
    }
}

/// Save timing; records duration and outcome when finished.
pub struct SaveTimer {
    start: Instant,
    route: &'static str,
}

impl SaveTimer {
    pub fn start(route: &'static str) -> Self {
        Self {
            start: Instant::now(),
            route,
        }
    }

    /// Record the outcome of the save.
    pub fn finish(self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        histogram!("trellis_save_duration_seconds", "route" => self.route)
            .record(self.start.elapsed().as_secs_f64());
        counter!("trellis_saves_total", "route" => self.route, "outcome" => outcome).increment(1);
    }
}
