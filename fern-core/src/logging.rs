//! Logging substrate: a thin, optional helper around `tracing_subscriber`'s
//! `EnvFilter`. Library crates never install a subscriber themselves; this is
//! here purely so binaries and integration tests across the workspace share
//! one `RUST_LOG`-driven setup instead of each reinventing it.

/// Install a global `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info` when unset. Safe to call more than once; only the
/// first call takes effect.
pub fn init_logging() {
    let filter = crate::env::env_get::<String>("RUST_LOG", "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(true)
        .try_init();
}
