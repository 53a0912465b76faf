use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize process-wide logging.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr, or is appended to `file_path` when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let file = match &config.file_path {
        Some(path) => Some(std::sync::Arc::new(
            std::fs::OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true);

        match file {
            Some(file) => registry.with(json_layer.with_writer(file)).try_init()?,
            None => registry.with(json_layer).try_init()?,
        }
    } else {
        let pretty_layer = fmt::layer()
            .with_span_events(FmtSpan::NONE)
            .with_target(true)
            .with_line_number(false);

        match file {
            Some(file) => registry.with(pretty_layer.with_ansi(false).with_writer(file)).try_init()?,
            None => registry.with(pretty_layer).try_init()?,
        }
    }

    Ok(())
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("Debug").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_init_logging_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("descrambler.log");
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            file_path: Some(path.to_string_lossy().into_owned()),
        };
        // another test may already own the global subscriber
        let _ = init_logging(&config);
        assert!(path.exists());
    }
}
