// Structured logging setup
//
// Thin wrapper over tracing-subscriber. Call once at startup; repeated
// initialization (test binaries) is tolerated.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging infrastructure with the default filter.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false)
}

/// Initialize logging, optionally with debug output for this crate.
pub fn init_logging_with_level(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        EnvFilter::new("metricflowd=debug,info")
    } else {
        EnvFilter::new("metricflowd=info,warn")
    };

    // RUST_LOG wins when set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(default_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            info!("metricflowd observability initialized");
            Ok(())
        }
        // Already initialized, which is fine in test environments
        Err(_) => Ok(()),
    }
}
