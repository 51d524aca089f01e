//! Structured logging setup.
//!
//! The engine only emits `tracing` events; installing a subscriber is the
//! host's choice. [`init_logging`] is the stock way to do it.

use std::collections::HashMap;

use serde::Deserialize;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const ENGINE_TARGET: &str = "trellis_core";

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level for everything outside the engine (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Level for the engine's own events; falls back to `level`
    #[serde(default)]
    pub engine_level: Option<String>,

    #[serde(default)]
    pub format: LogFormat,

    /// Extra `target=level` overrides, e.g. `trellis_core::rules = "trace"`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Include file and line of each event
    #[serde(default)]
    pub include_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            engine_level: None,
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            span_events: SpanEventConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    #[default]
    Compact,
}

/// Which span lifecycle points are logged. Useful with the instrumented
/// save path, which opens one span per save.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub on_new: bool,
    #[serde(default)]
    pub on_close: bool,
}

impl SpanEventConfig {
    fn as_fmt_span(&self) -> FmtSpan {
        match (self.on_new, self.on_close) {
            (true, true) => FmtSpan::NEW | FmtSpan::CLOSE,
            (true, false) => FmtSpan::NEW,
            (false, true) => FmtSpan::CLOSE,
            (false, false) => FmtSpan::NONE,
        }
    }
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)?;

    if let Some(level) = &config.engine_level {
        filter = filter.add_directive(format!("{ENGINE_TARGET}={level}").parse()?);
    }
    for (target, level) in &config.module_levels {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }

    Ok(filter)
}

fn build_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer()
        .with_span_events(config.span_events.as_fmt_span())
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    }
}

/// Install a global subscriber.
///
/// # Errors
///
/// Malformed level directives, or a global subscriber already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;

    tracing_subscriber::registry()
        .with(build_layer(config))
        .with(filter)
        .try_init()?;

    Ok(())
}
