//! Structured logging setup.
//!
//! The engine itself only emits `tracing` events; binaries embedding it call
//! [`init_logging`] once at startup. `RUST_LOG` overrides the configured level.

use crate::config::LoggingConfig;
use tracing::debug;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Install a global fmt subscriber for `config`.
///
/// Returns `false` when a global subscriber was already installed, which is harmless.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        debug!(app = %config.app_name, "Logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}
