//! Logging and Tracing Setup
//!
//! Installs the process-wide tracing subscriber for hosts that do not bring
//! their own:
//! - Console output, text or JSON
//! - Level from `LOG_LEVEL` (debug|info|warn|error|dpanic|panic|fatal),
//!   overridable per target through `RUST_LOG`
//! - Optional OTLP span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//!
//! Environment variables:
//! - `LOG_LEVEL` - Default level, case-insensitive (default: `info`)
//! - `LOG_FORMAT` - Set to `json` for JSON output (default: `text`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - OTLP endpoint (e.g., `http://tempo:4317`)
//! - `OTEL_SERVICE_NAME` - Service name (default: `tether`)
//!
//! The registry itself only emits events; it never installs a subscriber.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{warn, Level};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),

    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown level string {0:?}, defaulting to info")]
pub struct UnknownLevel(pub String);

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Raw level string (None = info)
    pub level: Option<String>,
    /// Log format: "text" or "json"
    pub format: String,
    /// OTLP endpoint for trace export (None = disabled)
    pub otlp_endpoint: Option<String>,
    /// Service name for exported traces
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").ok(),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "tether".to_string()),
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }
}

/// Parse a level name. The panic levels have no tracing equivalent and map
/// to `ERROR`.
pub fn parse_level(raw: &str) -> Result<Level, UnknownLevel> {
    match raw.trim().to_lowercase().as_str() {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" | "dpanic" | "panic" | "fatal" => Ok(Level::ERROR),
        _ => Err(UnknownLevel(raw.to_string())),
    }
}

/// Effective level plus the fallback notice, if the input was not usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelResolution {
    pub level: Level,
    pub fallback: Option<UnknownLevel>,
}

/// Resolve the configured level. Unset or empty means info without a
/// notice; an unrecognized value means info with a notice.
pub fn resolve_level(raw: Option<&str>) -> LevelResolution {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => LevelResolution {
            level: Level::INFO,
            fallback: None,
        },
        Some(value) => match parse_level(value) {
            Ok(level) => LevelResolution {
                level,
                fallback: None,
            },
            Err(unknown) => LevelResolution {
                level: Level::INFO,
                fallback: Some(unknown),
            },
        },
    }
}

/// Emit the fallback warning for an unrecognized level, once.
pub fn report_level_fallback(resolution: &LevelResolution) {
    if let Some(unknown) = &resolution.fallback {
        warn!(value = %unknown.0, "{}", unknown);
    }
}

/// Keeps the tracer provider alive; dropping it flushes pending spans.
#[must_use = "dropping the guard shuts down trace export"]
pub struct LoggingGuard {
    provider: Option<SdkTracerProvider>,
}

impl LoggingGuard {
    /// Flush and shut down trace export now instead of on drop.
    pub fn shutdown(mut self) {
        self.shutdown_provider();
    }

    fn shutdown_provider(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "Error shutting down tracer provider");
            }
        }
    }
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        self.shutdown_provider();
    }
}

/// Install the tracing subscriber.
///
/// Call once at process start and hold the returned guard until exit.
pub fn init_logging(config: LogConfig) -> Result<LoggingGuard, LoggingError> {
    let resolution = resolve_level(config.level.as_deref());
    let is_json = config.format.eq_ignore_ascii_case("json");

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(resolution.level).into())
        .from_env_lossy();

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| LoggingError::Exporter(e.to_string()))?;

            let resource = Resource::builder()
                .with_service_name(config.service_name.clone())
                .build();

            Some(
                SdkTracerProvider::builder()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(resource)
                    .with_batch_exporter(exporter)
                    .build(),
            )
        }
        None => None,
    };

    let otel_layer = provider
        .as_ref()
        .map(|provider| OpenTelemetryLayer::new(provider.tracer("tether")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(is_json.then(|| fmt::layer().json()))
        .with((!is_json).then(fmt::layer))
        .try_init()?;

    report_level_fallback(&resolution);

    match &config.otlp_endpoint {
        Some(endpoint) => tracing::info!(
            endpoint = %endpoint,
            service_name = %config.service_name,
            "OpenTelemetry tracing initialized"
        ),
        None => tracing::debug!("Tracing initialized (no OTLP export)"),
    }

    Ok(LoggingGuard { provider })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer};

    struct CountWarnings(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for CountWarnings {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_parse_known_levels_case_insensitive() {
        assert_eq!(parse_level("DEBUG"), Ok(Level::DEBUG));
        assert_eq!(parse_level("Info"), Ok(Level::INFO));
        assert_eq!(parse_level("warn"), Ok(Level::WARN));
        assert_eq!(parse_level("error"), Ok(Level::ERROR));
        assert_eq!(parse_level("DPanic"), Ok(Level::ERROR));
        assert_eq!(parse_level("panic"), Ok(Level::ERROR));
        assert_eq!(parse_level("FATAL"), Ok(Level::ERROR));
    }

    #[test]
    fn test_unset_level_defaults_silently() {
        for raw in [None, Some(""), Some("  ")] {
            let resolution = resolve_level(raw);
            assert_eq!(resolution.level, Level::INFO);
            assert!(resolution.fallback.is_none());
        }
    }

    #[test]
    fn test_unknown_level_falls_back_with_one_warning() {
        let resolution = resolve_level(Some("TRACE"));
        assert_eq!(resolution.level, Level::INFO);
        assert_eq!(resolution.fallback, Some(UnknownLevel("TRACE".to_string())));
        assert_eq!(resolution.clone(), resolution);

        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(CountWarnings(count.clone()));
        tracing::subscriber::with_default(subscriber, || report_level_fallback(&resolution));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_known_level_reports_nothing() {
        let resolution = resolve_level(Some("warn"));
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(CountWarnings(count.clone()));
        tracing::subscriber::with_default(subscriber, || report_level_fallback(&resolution));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
