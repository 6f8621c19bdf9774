use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format selected through `UWB_LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("UWB_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

pub fn init(format: LogFormat) {
    match format {
        LogFormat::Json => init_logging(),
        LogFormat::Pretty => init_logging_pretty(),
    }
}

/// Structured JSON output
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,uwb_proximity=info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized");
}

/// Human-readable output for local runs
pub fn init_logging_pretty() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,uwb_proximity=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized (pretty mode)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_defaults_to_pretty() {
        std::env::remove_var("UWB_LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    }
}
