//! Tracing initialisation for the Maestro binaries.
//!
//! Call [`init_tracing`] once at startup. `RUST_LOG` takes precedence over
//! the level passed in; later calls are ignored because the global
//! subscriber can only be installed once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// * `json`: emit newline-delimited JSON instead of human-readable lines.
/// * `level`: default verbosity when `RUST_LOG` is unset.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        registry.with(fmt::layer().with_target(false)).try_init().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::DEBUG);
        init_tracing(true, Level::INFO);
        tracing::info!(event = "test.after_init");
    }
}
