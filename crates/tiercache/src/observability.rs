//! Tracing setup for the probe binary and embedders that don't bring their
//! own subscriber.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Install a subscriber at `info` until settings are loaded.
pub fn init_tracing() {
    install("info");
}

/// Install a subscriber using the level from the `[logging]` section, or
/// retarget the one installed by [`init_tracing`].
///
/// `RUST_LOG`, when set and parseable, takes precedence.
pub fn init_tracing_from(logging: &LoggingConfig) {
    install(&logging.level);
}

fn install(level: &str) {
    let (reload_layer, handle) = reload::Layer::new(filter_for(level));
    if LOG_RELOAD_HANDLE.set(handle).is_err() {
        if let Some(existing) = LOG_RELOAD_HANDLE.get() {
            let _ = existing.modify(|f| *f = filter_for(level));
        }
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

fn filter_for(level: &str) -> EnvFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

/// Force a new logging level at runtime, overriding `RUST_LOG`. No-op unless
/// a subscriber was installed here.
pub fn apply_logging_level(level: &str) {
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let _ = handle.modify(|f| {
            *f = EnvFilter::new(level);
        });
    }
}
