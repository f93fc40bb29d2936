//! Tracing setup: structured JSON file output plus a compact terminal layer.
//!
//! `RUST_LOG` controls filtering (default "info"); file output rotates daily
//! under `<output root>/logs/`.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the global subscriber. Call once, before the crawl starts.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("env filter");

    let json_appender = tracing_appender::rolling::daily(log_path, "webrecon.json.log");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stdout_layer)
        .init();

    // The non-blocking writer stops on guard drop; keep it alive for the
    // whole process.
    Box::leak(Box::new(json_guard));

    tracing::debug!("logging initialized, files under {}", log_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    #[test]
    fn log_directory_is_creatable() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("logs");
        // init_logging sets a global subscriber, so only exercise the
        // directory handling here.
        std::fs::create_dir_all(&log_path).unwrap();
        assert!(log_path.exists());
    }
}
