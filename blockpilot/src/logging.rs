use std::env;
use std::error::Error;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs the global stderr subscriber.
///
/// `LOG_LEVEL` (error, warn, info, debug) sets the base level; `RUST_LOG`
/// directives are layered on top.
pub fn init_logging() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let log_level = env::var("LOG_LEVEL")
        .map(|level| parse_level(&level))
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        _ => Level::INFO,
    }
}
