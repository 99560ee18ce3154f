//! Logging initialization
//!
//! Respects `RUST_LOG`; falls back to a config-provided filter, then "info".

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `filter` is an optional directive string from configuration (for example
/// `"info"` or `"forgepool=debug"`). `RUST_LOG` always takes precedence.
/// Calling this twice is a no-op; the second init attempt is discarded.
pub fn init_logging(filter: Option<&str>) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter.unwrap_or("info"))
    };

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(env_filter)
        .try_init();
}
