//! Logging setup and the explicit logging context handed to components.
//!
//! The subscriber is installed once by [`init_telemetry`]. Components never
//! reach for process-wide logger objects: each receives a [`LogContext`]
//! at construction and logs through the fixed `debug!`/`info!`/`warn!`/`error!`
//! tracing macros with its component span as the explicit parent.

use tracing::{Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tether_upstream" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Render the filter directive string, e.g. `info,tether_upstream=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Explicit logging context. Cheap to clone; constructed once at startup
/// and passed by reference to every component constructor.
#[derive(Clone, Debug)]
pub struct LogContext {
    root: Span,
}

impl LogContext {
    /// Context that does not install a subscriber. Events still flow to
    /// whatever subscriber is active (none in most unit tests).
    pub fn detached() -> Self {
        Self {
            root: tracing::info_span!("tether"),
        }
    }

    /// Span to use as the explicit parent for a component's log events.
    pub fn component(&self, name: &'static str) -> Span {
        tracing::info_span!(parent: &self.root, "component", name = name)
    }

    pub fn root(&self) -> &Span {
        &self.root
    }
}

/// Initialize the tracing subscriber and return the root logging context.
/// Call once at startup; a second call keeps the first subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> LogContext {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("tether-telemetry: subscriber already installed: {e}");
    }

    LogContext::detached()
}
