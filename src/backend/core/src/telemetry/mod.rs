//! Telemetry: structured logging setup and engine metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{describe_engine_metrics, OwnershipMetrics, RuleMetrics, SaveTimer};
