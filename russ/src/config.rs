//! Environment-driven configuration, gathered into one struct rather than scattering
//! `env::var` calls through the resolver and server (spec.md §9 "Global state": the services
//! directory is captured once per call, not cached at process start).

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Default services directory root, used when `RUSS_SERVICES_DIR` is unset.
pub const DEFAULT_SERVICES_DIR: &str = "/var/run/russ/services";

/// The environment variable that overrides the services directory root.
pub const SERVICES_DIR_ENV: &str = "RUSS_SERVICES_DIR";

/// Default accept-loop timeout for a [`crate::server::Server`], in milliseconds.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default await timeout: how long the server blocks reading a request after accept.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// The handful of environment-driven knobs this crate reads, gathered into one struct with a
/// `from_env()` constructor, matching the small-systems-crate convention of centralizing
/// scattered `env::var` calls (c.f. `base`'s `sys_util` config helpers in the teacher crate).
#[derive(Debug, Clone)]
pub struct RussConfig {
    pub services_dir: PathBuf,
    pub accept_timeout: Duration,
    pub await_timeout: Duration,
}

impl RussConfig {
    /// Reads `RUSS_SERVICES_DIR` from the environment, falling back to
    /// [`DEFAULT_SERVICES_DIR`]. Timeouts are not currently environment-driven; they use the
    /// library defaults.
    pub fn from_env() -> RussConfig {
        RussConfig {
            services_dir: services_dir(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
        }
    }
}

impl Default for RussConfig {
    fn default() -> RussConfig {
        RussConfig::from_env()
    }
}

/// Reads the services directory root, re-reading the environment on every call (spec.md §9: no
/// caching beyond what `std::env::var` already does).
pub fn services_dir() -> PathBuf {
    std::env::var_os(SERVICES_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(DEFAULT_SERVICES_DIR).to_owned())
}
