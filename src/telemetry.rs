//! Explicit, constructed observability wiring.
//!
//! This module's [`init`] is called exactly once, from `main`, and returns
//! a guard the caller owns — there is no `LazyLock`/`OnceLock` triggered
//! implicitly by first use anywhere in this crate.

use tracing_subscriber::EnvFilter;

use crate::config::{LogEncoding, LoggingConfig};

/// Initializes the global `tracing` subscriber. Must be called once, before
/// any other component logs. Dropping the returned guard is not required for
/// a long-running server process (there is no non-blocking writer to flush);
/// it exists so callers that do use one can extend this function later
/// without changing the call site.
pub fn init(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match cfg.encoding {
        LogEncoding::Json => {
            let _ = subscriber.json().with_ansi(false).try_init();
        }
        LogEncoding::Console => {
            let _ = subscriber.pretty().with_ansi(cfg.development).try_init();
        }
    }
}
