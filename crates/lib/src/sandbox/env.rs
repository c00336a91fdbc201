//! The environment a build's sub-processes see.
//!
//! Nothing is inherited implicitly: a [`BuildEnv`] starts from the names on
//! the allow-list, then the fixed entries are layered on top. Mutations only
//! affect commands run after them within the same build context.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::consts::SOURCE_DATE_EPOCH;

/// Environment variables exported to build sub-processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnv {
  vars: BTreeMap<String, String>,
}

impl BuildEnv {
  /// An empty environment.
  pub fn new() -> Self {
    Self::default()
  }

  /// Copy the allowed names from the current process environment.
  pub fn from_allow_list<S: AsRef<str>>(allow: &[S]) -> Self {
    let mut env = Self::new();
    for name in allow {
      if let Ok(value) = std::env::var(name.as_ref()) {
        env.vars.insert(name.as_ref().to_string(), value);
      }
    }
    env
  }

  /// The allow-listed ambient variables plus the fixed build entries.
  ///
  /// `HOME` and `TMPDIR` point inside `workspace`; `shared_prefix` is exported
  /// as `CELLAR_PREFIX`.
  pub fn isolated<S: AsRef<str>>(allow: &[S], workspace: &Path, shared_prefix: &Path, jobs: usize) -> Self {
    let mut env = Self::from_allow_list(allow);
    env.set("HOME", workspace.join(".home").display().to_string());
    env.set("TMPDIR", workspace.join(".tmp").display().to_string());
    env.set("LANG", "C");
    env.set("LC_ALL", "C");
    env.set("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);
    env.set("MAKEFLAGS", format!("-j{}", jobs.max(1)));
    env.set("CELLAR_PREFIX", shared_prefix.display().to_string());
    if !env.vars.contains_key("PATH") {
      env.set("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
    }
    env
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.vars.get(key).map(String::as_str)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let key = key.into();
    let value = value.into();
    debug!(key = %key, value = %value, "set build env");
    self.vars.insert(key, value);
  }

  pub fn remove(&mut self, key: &str) -> Option<String> {
    self.vars.remove(key)
  }

  /// Append `value` to `key`, separated by `separator` when the key is already set.
  pub fn append(&mut self, key: &str, value: &str, separator: &str) {
    let joined = match self.vars.get(key) {
      Some(existing) if !existing.is_empty() => format!("{}{}{}", existing, separator, value),
      _ => value.to_string(),
    };
    self.set(key, joined);
  }

  /// Prepend a directory to `PATH`.
  pub fn prepend_path(&mut self, dir: &Path) {
    let dir = dir.display().to_string();
    let joined = match self.vars.get("PATH") {
      Some(existing) if !existing.is_empty() => format!("{}:{}", dir, existing),
      _ => dir,
    };
    self.set("PATH", joined);
  }

  /// Append flags to `CFLAGS`, `CXXFLAGS`, `OBJCFLAGS` and `OBJCXXFLAGS`.
  pub fn append_to_cflags(&mut self, flags: &str) {
    for key in ["CFLAGS", "CXXFLAGS", "OBJCFLAGS", "OBJCXXFLAGS"] {
      self.append(key, flags, " ");
    }
  }

  /// Force serial make.
  pub fn deparallelize(&mut self) {
    self.set("MAKEFLAGS", "-j1");
  }

  /// Current make job count, from `MAKEFLAGS`.
  pub fn make_jobs(&self) -> usize {
    self
      .get("MAKEFLAGS")
      .and_then(|flags| flags.split_whitespace().find_map(|f| f.strip_prefix("-j")))
      .and_then(|n| n.parse().ok())
      .unwrap_or(1)
  }

  pub fn vars(&self) -> &BTreeMap<String, String> {
    &self.vars
  }
}
