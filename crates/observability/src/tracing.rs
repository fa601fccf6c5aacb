//! Tracing/logging initialization.
//!
//! Scheduler loops log with structured fields (`job_id`, `provider`,
//! `retry_count`, ...), so the default output is JSON for log shippers.
//! `RUST_LOG` overrides the filter as usual.

use tracing_subscriber::EnvFilter;

/// Initialize JSON tracing for the process with the filter taken from the
/// environment (falling back to `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    init_with_filter(filter);
}

/// Initialize JSON tracing with an explicit filter.
///
/// Useful for embedders that assemble their own directives (e.g. quieting
/// the poller while debugging dispatch).
pub fn init_with_filter(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
