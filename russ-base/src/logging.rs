//! Optional `env_logger` bootstrap for binaries linking this crate.
//!
//! The library itself never installs a global logger implicitly — only a `main()` should do
//! that — but ship a ready-made `init()` so every front-end and bundled server configures
//! logging identically instead of reinventing it.

/// Installs `env_logger` with RUSS's conventional defaults: level from `RUSS_LOG` (falling back
/// to `info`), timestamps to millisecond precision.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUSS_LOG", "info"))
        .format_timestamp_millis()
        .try_init();
}
