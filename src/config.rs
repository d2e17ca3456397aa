//! Runtime configuration assembled from environment variables (spec §6).

use thiserror::Error;

use crate::{executor::FailureMode, runtime::Runtime};

/// `WIREIT_CACHE`: which cache backend to use. Only `Local` has an
/// implementation in this core (§1 Non-goals: no remote cache backend); a
/// driver selecting `Github` gets no backend wired in and should warn.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum CacheMode {
    #[default]
    Local,
    Github,
    None,
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Config {
    /// `None` means unbounded (`WIREIT_PARALLEL=infinity`).
    pub parallelism: Option<usize>,
    pub cache: CacheMode,
    pub failures: FailureMode,
    /// `WIREIT_LOGGER`: which terminal logger to use. The core only exposes
    /// the selection; the logger itself is a driver concern (spec §1).
    pub logger: Option<String>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("WIREIT_PARALLEL must be a positive integer or \"infinity\", got {0:?}")]
    InvalidParallel(String),
    #[error("WIREIT_CACHE must be one of local|github|none, got {0:?}")]
    InvalidCache(String),
    #[error("WIREIT_FAILURES must be one of no-new|continue|kill, got {0:?}")]
    InvalidFailures(String),
}

/// Env vars whose presence (with a truthy value) indicates a CI runner,
/// mirroring the "none on CI sentinel" default for `WIREIT_CACHE` (spec §6).
const CI_SENTINEL_VARS: &[&str] = &["CI", "CONTINUOUS_INTEGRATION", "GITHUB_ACTIONS"];

pub fn resolve(runtime: &dyn Runtime) -> Result<Config, ConfigError> {
    let parallelism = match runtime.env_var("WIREIT_PARALLEL") {
        None => Some(default_parallelism()),
        Some(v) if v.eq_ignore_ascii_case("infinity") => None,
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => return Err(ConfigError::InvalidParallel(v)),
        },
    };

    let cache = match runtime.env_var("WIREIT_CACHE").as_deref() {
        Some("local") => CacheMode::Local,
        Some("github") => CacheMode::Github,
        Some("none") => CacheMode::None,
        Some(other) => return Err(ConfigError::InvalidCache(other.to_string())),
        None if is_ci(runtime) => CacheMode::None,
        None => CacheMode::Local,
    };

    let failures = match runtime.env_var("WIREIT_FAILURES").as_deref() {
        Some("no-new") | None => FailureMode::NoNew,
        Some("continue") => FailureMode::Continue,
        Some("kill") => FailureMode::Kill,
        Some(other) => return Err(ConfigError::InvalidFailures(other.to_string())),
    };

    let logger = runtime.env_var("WIREIT_LOGGER");

    Ok(Config { parallelism, cache, failures, logger })
}

fn is_ci(runtime: &dyn Runtime) -> bool {
    CI_SENTINEL_VARS
        .iter()
        .any(|name| runtime.env_var(name).is_some_and(|v| !v.is_empty() && v != "false" && v != "0"))
}

fn default_parallelism() -> usize {
    num_cpus::get().saturating_mul(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeRuntime;

    #[test]
    fn defaults_to_local_cache_and_no_new_failures() {
        let runtime = FakeRuntime::new();
        let config = resolve(&runtime).unwrap();
        assert_eq!(config.cache, CacheMode::Local);
        assert_eq!(config.failures, FailureMode::NoNew);
        assert!(config.parallelism.is_some());
    }

    #[test]
    fn ci_sentinel_disables_cache_by_default() {
        let runtime = FakeRuntime::new().with_env("CI", "true");
        let config = resolve(&runtime).unwrap();
        assert_eq!(config.cache, CacheMode::None);
    }

    #[test]
    fn explicit_cache_mode_overrides_ci_sentinel() {
        let runtime = FakeRuntime::new().with_env("CI", "true").with_env("WIREIT_CACHE", "local");
        let config = resolve(&runtime).unwrap();
        assert_eq!(config.cache, CacheMode::Local);
    }

    #[test]
    fn parallel_infinity_means_unbounded() {
        let runtime = FakeRuntime::new().with_env("WIREIT_PARALLEL", "infinity");
        let config = resolve(&runtime).unwrap();
        assert_eq!(config.parallelism, None);
    }

    #[test]
    fn parallel_zero_is_rejected() {
        let runtime = FakeRuntime::new().with_env("WIREIT_PARALLEL", "0");
        assert_eq!(resolve(&runtime).unwrap_err(), ConfigError::InvalidParallel("0".to_string()));
    }

    #[test]
    fn invalid_failures_value_is_rejected() {
        let runtime = FakeRuntime::new().with_env("WIREIT_FAILURES", "bogus");
        assert!(matches!(resolve(&runtime), Err(ConfigError::InvalidFailures(_))));
    }
}
