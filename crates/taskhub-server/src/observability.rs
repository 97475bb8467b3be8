//! Log subscriber setup.
//!
//! Tracing starts before the config file is read, so the filter sits behind
//! a reload layer and `logging.level` is swapped in once config is loaded.
//! An explicit `RUST_LOG` always takes precedence.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

/// `RUST_LOG` when set and parseable, else `level`.
fn initial_filter(level: &str) -> EnvFilter {
    if rust_log_set()
        && let Ok(filter) = EnvFilter::try_from_default_env()
    {
        return filter;
    }
    EnvFilter::new(level)
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing_with_level(level: &str) {
    let (filter, handle) = reload::Layer::new(initial_filter(level));
    if FILTER.set(handle).is_err() {
        return;
    }
    // another subscriber may already be installed (tests)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches the active filter to `level` unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if rust_log_set() {
        tracing::debug!("RUST_LOG set, ignoring logging.level");
        return;
    }
    let Some(handle) = FILTER.get() else {
        return;
    };
    match handle.reload(EnvFilter::new(level)) {
        Ok(()) => tracing::debug!(level, "log level applied"),
        Err(e) => tracing::warn!(error = %e, level, "failed to apply log level"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_becomes_filter_without_rust_log() {
        if rust_log_set() {
            return;
        }
        assert_eq!(
            initial_filter("debug").max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::DEBUG)
        );
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing_with_level("warn");
        init_tracing_with_level("trace");
        apply_logging_level("info");
        assert!(FILTER.get().is_some());
    }
}
