//! Tracing initialisation for the sync daemon

use tracing_subscriber::EnvFilter;

/// Default filter used when neither `RUST_LOG` nor the config provides one.
pub const DEFAULT_LOG_FILTER: &str = "lobby_sync=info";

/// Build the filter directive for a configured level, e.g. `"debug"` becomes
/// `"lobby_sync=debug"`.
pub fn filter_for_level(level: &str) -> String {
    format!("lobby_sync={}", level.trim().to_ascii_lowercase())
}

/// Initialise the global subscriber. `RUST_LOG` wins over `default_filter`.
/// Calling this more than once is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_level() {
        assert_eq!(filter_for_level("DEBUG "), "lobby_sync=debug");
        assert_eq!(filter_for_level("warn"), "lobby_sync=warn");
    }

    #[test]
    fn test_init_twice_is_ignored() {
        init_tracing(DEFAULT_LOG_FILTER);
        init_tracing(DEFAULT_LOG_FILTER);
    }
}
