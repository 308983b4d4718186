//! hermes-sshappbackend/src/logging.rs
//! Logging initialization, reloadable at runtime (§A "Logging").

use std::sync::{Once, OnceLock};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt, reload::Layer as ReloadLayer, reload::Handle};

static LOG_INIT: Once = Once::new();
static RELOAD_HANDLE: OnceLock<Handle<EnvFilter, tracing_subscriber::Registry>> = OnceLock::new();

/// Maps `HERMES_LOG_LEVEL` (`debug|info|warn|error|fatal`, §6) to a filter
/// directive. `fatal` has no tracing equivalent and is treated as `error`.
fn directive_for(level: &str) -> &'static str {
    match level {
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}

/// Initializes the global subscriber exactly once, reading `HERMES_LOG_LEVEL`
/// if set, falling back to `default`. Safe to call from multiple entry
/// points (agent main, controller bootstrap, tests).
pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let level = std::env::var("HERMES_LOG_LEVEL")
            .ok()
            .map(|v| directive_for(&v).to_string())
            .unwrap_or_else(|| default.to_string());
        let filter = EnvFilter::new(level);
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry().with(reload_layer).with(fmt::layer());
        let _ = tracing::subscriber::set_global_default(subscriber);
        let _ = RELOAD_HANDLE.set(handle);
    });
}

/// Updates the active filter at runtime, e.g. in response to a config
/// change. No-op if logging hasn't been initialized yet.
pub fn set_log_level(level: &str) {
    if let Some(handle) = RELOAD_HANDLE.get() {
        let _ = handle.modify(|filter| *filter = EnvFilter::new(directive_for(level)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(directive_for("chaos"), "info");
    }

    #[test]
    fn fatal_maps_to_error() {
        assert_eq!(directive_for("fatal"), "error");
    }
}
