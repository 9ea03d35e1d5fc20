use crate::{
    config::{LogFormat, LoggingConfig},
    error::{AppError, Result},
};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};
use uuid::Uuid;

const DEFAULT_FILTER: &str = "warn,reportmcp_resilience=info";

/// Initialize structured logging, honouring `RUST_LOG` when set.
pub fn init_structured_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_span_events(FmtSpan::NONE)
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("Logging already initialized: {}", e)))
}

/// Initialize logging from a [`LoggingConfig`].
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = level_filter(&config.level);

    let fmt_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .json()
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .pretty()
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::NONE)
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .compact()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("Logging already initialized: {}", e)))?;

    info!(
        level = %config.level,
        format = ?config.format,
        "Structured logging initialized"
    );
    Ok(())
}

/// Correlation id attached to the span of a single resilient call.
pub fn new_correlation_id() -> Uuid {
    Uuid::new_v4()
}

/// Accepts any `EnvFilter` directive string; unparsable input falls back to `info`.
fn level_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}
