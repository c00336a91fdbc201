use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the user's home directory
pub fn home_dir() -> PathBuf {
  std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

/// Returns the directory for data files for the application
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the directory for cache files for the application
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Returns the installation prefix.
///
/// `CELLAR_PREFIX` wins; otherwise the per-user data directory is used.
pub fn prefix_dir() -> PathBuf {
  if let Ok(path) = std::env::var("CELLAR_PREFIX") {
    return PathBuf::from(path);
  }
  data_dir()
}

/// Returns the download/build cache directory (`CELLAR_CACHE` overrides).
pub fn downloads_cache_dir() -> PathBuf {
  if let Ok(path) = std::env::var("CELLAR_CACHE") {
    return PathBuf::from(path);
  }
  cache_dir()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn xdg_fallback_to_home_directories() {
    temp_env::with_vars(
      [
        ("XDG_DATA_HOME", None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(data_dir(), PathBuf::from("/home/user/.local/share").join(APP_NAME));
        assert_eq!(cache_dir(), PathBuf::from("/home/user/.cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn prefix_env_var_overrides_default() {
    temp_env::with_vars(
      [("CELLAR_PREFIX", Some("/custom/prefix")), ("HOME", Some("/home/user"))],
      || {
        assert_eq!(prefix_dir(), PathBuf::from("/custom/prefix"));
      },
    );
  }

  #[test]
  #[serial]
  fn prefix_defaults_to_data_dir() {
    temp_env::with_vars(
      [
        ("CELLAR_PREFIX", None::<&str>),
        ("XDG_DATA_HOME", Some("/xdg/data")),
      ],
      || {
        assert_eq!(prefix_dir(), PathBuf::from("/xdg/data").join(APP_NAME));
      },
    );
  }
}
