//! Engine configuration.
//!
//! Defaults come from the platform paths; every field can be overridden through
//! a `CELLAR_*` environment variable or set directly by the embedding caller.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::platform::paths::{downloads_cache_dir, prefix_dir};

/// Ambient variables a build is allowed to inherit from the invoking environment.
pub const DEFAULT_ENV_ALLOW_LIST: &[&str] = &["PATH", "CC", "CXX", "SDKROOT", "DEVELOPER_DIR", "MAKEFLAGS"];

/// Configuration for resolution, fetching and build execution.
#[derive(Debug, Clone)]
pub struct Config {
  /// Installation prefix; kegs live under `<prefix>/Cellar`.
  pub prefix: PathBuf,

  /// Cache directory for downloads and build workspaces.
  pub cache: PathBuf,

  /// Maximum number of graph nodes built in parallel.
  pub parallelism: usize,

  /// `-j` hint exported to build tools through `MAKEFLAGS`.
  pub make_jobs: usize,

  /// Timeout applied to each network transfer.
  pub fetch_timeout: Duration,

  /// Timeout applied to each sub-process a build procedure runs.
  pub command_timeout: Duration,

  /// Names of ambient environment variables passed through to builds.
  pub env_allow_list: Vec<String>,

  /// Run the formula self-test after a successful install.
  pub run_tests: bool,

  /// Ignore prebuilt artifacts and always build from source.
  pub build_from_source: bool,
}

impl Default for Config {
  fn default() -> Self {
    let cpus = num_cpus();
    Self {
      prefix: prefix_dir(),
      cache: downloads_cache_dir(),
      parallelism: cpus,
      make_jobs: cpus,
      fetch_timeout: Duration::from_secs(300),
      command_timeout: Duration::from_secs(3600),
      env_allow_list: DEFAULT_ENV_ALLOW_LIST.iter().map(|s| s.to_string()).collect(),
      run_tests: false,
      build_from_source: false,
    }
  }
}

impl Config {
  /// Defaults overlaid with `CELLAR_JOBS`, `CELLAR_FETCH_TIMEOUT` and
  /// `CELLAR_BUILD_TIMEOUT` (seconds). Unparseable values are ignored with a warning.
  pub fn from_env() -> Self {
    let mut config = Self::default();

    if let Some(jobs) = env_number("CELLAR_JOBS") {
      config.parallelism = jobs.max(1) as usize;
      config.make_jobs = jobs.max(1) as usize;
    }
    if let Some(secs) = env_number("CELLAR_FETCH_TIMEOUT") {
      config.fetch_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = env_number("CELLAR_BUILD_TIMEOUT") {
      config.command_timeout = Duration::from_secs(secs);
    }

    config
  }

  pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn with_cache(mut self, cache: impl Into<PathBuf>) -> Self {
    self.cache = cache.into();
    self
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  /// Directory for verified downloads.
  pub fn downloads_dir(&self) -> PathBuf {
    self.cache.join("downloads")
  }

  /// Directory under which per-build workspaces are created.
  pub fn builds_dir(&self) -> PathBuf {
    self.cache.join("builds")
  }
}

fn env_number(var: &str) -> Option<u64> {
  let value = std::env::var(var).ok()?;
  match value.trim().parse::<u64>() {
    Ok(n) => Some(n),
    Err(_) => {
      warn!(var, value = %value, "ignoring non-numeric configuration value");
      None
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn default_parallelism_is_positive() {
    let config = Config::default();
    assert!(config.parallelism >= 1);
    assert!(config.env_allow_list.iter().any(|v| v == "PATH"));
  }

  #[test]
  #[serial]
  fn env_overrides_apply() {
    temp_env::with_vars(
      [
        ("CELLAR_JOBS", Some("3")),
        ("CELLAR_FETCH_TIMEOUT", Some("7")),
        ("CELLAR_PREFIX", Some("/tmp/cellar-prefix")),
      ],
      || {
        let config = Config::from_env();
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.make_jobs, 3);
        assert_eq!(config.fetch_timeout, Duration::from_secs(7));
        assert_eq!(config.prefix, PathBuf::from("/tmp/cellar-prefix"));
      },
    );
  }

  #[test]
  #[serial]
  fn garbage_values_are_ignored() {
    temp_env::with_var("CELLAR_JOBS", Some("many"), || {
      let config = Config::from_env();
      assert_eq!(config.parallelism, Config::default().parallelism);
    });
  }

  #[test]
  fn derived_directories_live_under_cache() {
    let config = Config::default().with_cache("/c");
    assert_eq!(config.downloads_dir(), PathBuf::from("/c/downloads"));
    assert_eq!(config.builds_dir(), PathBuf::from("/c/builds"));
  }
}
