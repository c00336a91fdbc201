//! Error and report types for install sessions.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::bottle::BottleError;
use crate::fetch::FetchError;
use crate::formula::Variant;
use crate::graph::GraphError;
use crate::layout::{InstallationRecord, LayoutError};
use crate::patch::PatchError;
use crate::prefix_lock::PrefixLockError;
use crate::registry::RegistryError;
use crate::sandbox::{BuildError, TestFailure};

/// Why a single graph node did not install.
#[derive(Debug, Error)]
pub enum NodeError {
  #[error("{formula}: no {variant} source is declared")]
  MissingSource { formula: String, variant: Variant },

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Patch(#[from] PatchError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Bottle(#[from] BottleError),

  #[error(transparent)]
  Layout(#[from] LayoutError),

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error("build workspace: {0}")]
  Workspace(#[source] std::io::Error),

  #[error("install task aborted: {0}")]
  Aborted(String),
}

/// Errors surfaced to the caller of an install session.
#[derive(Debug, Error)]
pub enum InstallError {
  #[error(transparent)]
  Resolve(#[from] GraphError),

  #[error("{name} failed: {source}")]
  Node {
    name: String,
    #[source]
    source: Arc<NodeError>,
  },

  #[error("{name} was not installed: dependency '{dependency}' failed")]
  DependencyFailed { name: String, dependency: String },

  #[error("{0} is not installed")]
  NotInstalled(String),

  #[error(transparent)]
  Test(#[from] TestFailure),

  #[error(transparent)]
  Lock(#[from] PrefixLockError),

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error("failed to set up fetcher: {0}")]
  Setup(#[source] FetchError),
}

/// How a node's keg came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
  /// Fetched, patched and built from source in this session.
  Built,
  /// Poured from a prebuilt artifact in this session.
  Poured,
  /// Already registered before the session reached it.
  AlreadyInstalled,
  /// Produced by a concurrent request for the same key.
  Shared,
}

impl fmt::Display for Provenance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Provenance::Built => "built",
      Provenance::Poured => "poured",
      Provenance::AlreadyInstalled => "already installed",
      Provenance::Shared => "shared",
    };
    f.write_str(s)
  }
}

/// A node that ended with a registered keg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
  pub record: InstallationRecord,
  pub provenance: Provenance,
}

/// A node that never ran because a dependency failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
  pub name: String,
  pub dependency: String,
}

/// Outcome of an install session, in completion order per wave.
#[derive(Debug, Default)]
pub struct InstallReport {
  pub installed: Vec<Installed>,
  pub failed: Vec<(String, Arc<NodeError>)>,
  pub skipped: Vec<Skipped>,
  /// Self-tests that did not pass. The installs stand.
  pub test_warnings: Vec<TestFailure>,
}

impl InstallReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn record(&self, name: &str) -> Option<&InstallationRecord> {
    self.installed.iter().find(|i| i.record.name == name).map(|i| &i.record)
  }

  pub fn provenance(&self, name: &str) -> Option<Provenance> {
    self.installed.iter().find(|i| i.record.name == name).map(|i| i.provenance)
  }

  /// The report, or the first failing node with its cause chain.
  pub fn into_result(self) -> Result<Self, InstallError> {
    if let Some((name, source)) = self.failed.first() {
      return Err(InstallError::Node {
        name: name.clone(),
        source: source.clone(),
      });
    }
    if let Some(skipped) = self.skipped.first() {
      return Err(InstallError::DependencyFailed {
        name: skipped.name.clone(),
        dependency: skipped.dependency.clone(),
      });
    }
    Ok(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::error::Error as _;

  #[test]
  fn into_result_reports_first_failure_with_cause() {
    let report = InstallReport {
      failed: vec![(
        "libfoo".to_string(),
        Arc::new(NodeError::Aborted("worker panicked".to_string())),
      )],
      skipped: vec![Skipped {
        name: "app".to_string(),
        dependency: "libfoo".to_string(),
      }],
      ..Default::default()
    };

    let err = report.into_result().unwrap_err();
    assert!(matches!(&err, InstallError::Node { name, .. } if name == "libfoo"));
    assert!(err.source().unwrap().to_string().contains("worker panicked"));
  }

  #[test]
  fn skipped_nodes_fail_the_result() {
    let report = InstallReport {
      skipped: vec![Skipped {
        name: "app".to_string(),
        dependency: "libfoo".to_string(),
      }],
      ..Default::default()
    };
    assert!(!report.is_success());
    assert!(matches!(
      report.into_result(),
      Err(InstallError::DependencyFailed { .. })
    ));
  }
}
