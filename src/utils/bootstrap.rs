//! Bootstrap utilities for estate binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter.
pub const LOG_ENV: &str = "ESTATE_LOG";

/// Initialize tracing with the ESTATE_LOG environment variable.
///
/// Defaults to "info" level if ESTATE_LOG is not set. Output goes to stderr
/// so stdout stays free for command results.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Configuration path from `--config <path>`, `--config=<path>` or `-c <path>`.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}
