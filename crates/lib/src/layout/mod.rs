//! Install layout mapper.
//!
//! # Layout
//!
//! ```text
//! <prefix>/
//! ├── Cellar/<name>/
//! │   ├── .staging-XXXXXX/               # in-progress build, removed on drop
//! │   └── <version>_<fingerprint>/       # keg, immutable once promoted
//! │       └── INSTALL_RECEIPT.json
//! ├── opt/<name> -> ../Cellar/<name>/<version>_<fingerprint>
//! └── bin/, lib/, share/, ...            # links into non-keg-only kegs
//! ```
//!
//! A build writes into a staging directory next to its future keg. Promotion
//! writes the receipt into staging and renames the whole directory into
//! place, so a keg either exists complete with its receipt or not at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::{CELLAR_DIR, INSTALL_RECEIPT, OPT_DIR, STAGING_PREFIX};
use crate::options::ResolvedOptions;
use crate::util::hash::{DirHashError, HashError, Hashable, hash_directory};

/// Keg subdirectories exposed on the shared prefix.
pub const LINKED_DIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "etc", "Frameworks"];

/// Characters of a resolved revision kept in a `HEAD-<rev>` version.
const SHORT_REVISION_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum LayoutError {
  #[error("cannot link {path}: already exists and is not owned by {formula} ({existing})")]
  LinkConflict {
    formula: String,
    path: PathBuf,
    existing: String,
  },

  #[error("{formula}: nothing was installed into the keg")]
  EmptyKeg { formula: String },

  #[error("invalid receipt {path}: {message}")]
  Receipt { path: PathBuf, message: String },

  #[error("failed to compute keg fingerprint: {0}")]
  Fingerprint(#[from] HashError),

  #[error("failed to hash keg contents: {0}")]
  ContentHash(#[from] DirHashError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

trait IoContext<T> {
  fn at(self, path: &Path) -> Result<T, LayoutError>;
}

impl<T> IoContext<T> for io::Result<T> {
  fn at(self, path: &Path) -> Result<T, LayoutError> {
    self.map_err(|source| LayoutError::Io {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// The immutable description of one installed keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRecord {
  pub name: String,
  pub version: String,
  pub options: ResolvedOptions,
  pub fingerprint: String,
  pub root: PathBuf,
  /// Installed files and symlinks relative to `root`, sorted.
  pub files: Vec<PathBuf>,
  /// Every formula needed at runtime, in build order.
  pub runtime_dependencies: Vec<String>,
  pub source_digest: Option<String>,
  pub revision: Option<String>,
  /// Hash over the keg tree, receipt excluded.
  pub content_hash: String,
  pub keg_only: bool,
  pub poured_from_bottle: bool,
  pub installed_at: u64,
}

impl InstallationRecord {
  /// Registry key: `<version>_<fingerprint>`.
  pub fn key(&self) -> String {
    keg_key(&self.version, &self.fingerprint)
  }

  #[cfg(test)]
  pub(crate) fn for_test(name: &str, version: &str, options: ResolvedOptions, root: &Path) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      fingerprint: options.fingerprint(),
      options,
      root: root.to_path_buf(),
      files: Vec::new(),
      runtime_dependencies: Vec::new(),
      source_digest: None,
      revision: None,
      content_hash: String::new(),
      keg_only: false,
      poured_from_bottle: false,
      installed_at: 0,
    }
  }
}

pub fn keg_key(version: &str, fingerprint: &str) -> String {
  format!("{}_{}", version, fingerprint)
}

/// `HEAD-<short revision>`.
pub fn head_version(revision: &str) -> String {
  let short: String = revision.chars().take(SHORT_REVISION_LEN).collect();
  format!("HEAD-{}", short)
}

/// What a keg's fingerprint is computed from.
#[derive(Debug, Clone)]
pub struct KegIdentity {
  pub name: String,
  pub version: String,
  pub options: ResolvedOptions,
  /// Verified digest of the primary source.
  pub source_digest: Option<String>,
  /// Resolved revision of a git source.
  pub revision: Option<String>,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
  name: &'a str,
  version: &'a str,
  options: String,
  source_digest: Option<&'a str>,
  revision: Option<&'a str>,
}

impl Hashable for FingerprintInput<'_> {}

impl KegIdentity {
  pub fn fingerprint(&self) -> Result<String, LayoutError> {
    let input = FingerprintInput {
      name: &self.name,
      version: &self.version,
      options: self.options.fingerprint(),
      source_digest: self.source_digest.as_deref(),
      revision: self.revision.as_deref(),
    };
    Ok(input.compute_hash()?.0)
  }
}

/// Parts of a record that are not part of the keg's identity.
#[derive(Debug, Clone, Default)]
pub struct KegDetails {
  pub runtime_dependencies: Vec<String>,
  pub keg_only: bool,
  pub poured_from_bottle: bool,
}

/// An in-progress keg. Removed on drop unless promoted.
#[derive(Debug)]
pub struct Staging {
  dir: TempDir,
}

impl Staging {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

/// Paths and operations on the installation prefix.
#[derive(Debug, Clone)]
pub struct Layout {
  prefix: PathBuf,
}

impl Layout {
  pub fn new(prefix: impl Into<PathBuf>) -> Self {
    Self { prefix: prefix.into() }
  }

  pub fn prefix(&self) -> &Path {
    &self.prefix
  }

  pub fn cellar(&self) -> PathBuf {
    self.prefix.join(CELLAR_DIR)
  }

  pub fn formula_dir(&self, name: &str) -> PathBuf {
    self.cellar().join(name)
  }

  pub fn keg_path(&self, name: &str, version: &str, fingerprint: &str) -> PathBuf {
    self.formula_dir(name).join(keg_key(version, fingerprint))
  }

  pub fn opt_path(&self, name: &str) -> PathBuf {
    self.prefix.join(OPT_DIR).join(name)
  }

  /// Create a fresh staging directory for `name`.
  pub fn stage(&self, name: &str) -> Result<Staging, LayoutError> {
    let dir = self.formula_dir(name);
    fs::create_dir_all(&dir).at(&dir)?;
    let staging = tempfile::Builder::new()
      .prefix(STAGING_PREFIX)
      .tempdir_in(&dir)
      .at(&dir)?;
    debug!(formula = name, staging = %staging.path().display(), "created staging directory");
    Ok(Staging { dir: staging })
  }

  /// Promote `staging` to the keg of `identity` and return its record.
  ///
  /// The receipt is written before the rename. A keg already at the target
  /// path is a leftover no record points to and is replaced.
  pub fn materialize(
    &self,
    staging: Staging,
    identity: &KegIdentity,
    details: KegDetails,
  ) -> Result<InstallationRecord, LayoutError> {
    let files = keg_files(staging.path())?;
    if files.is_empty() {
      return Err(LayoutError::EmptyKeg {
        formula: identity.name.clone(),
      });
    }

    let fingerprint = identity.fingerprint()?;
    let content_hash = hash_directory(staging.path(), &[INSTALL_RECEIPT])?.0;
    let root = self.keg_path(&identity.name, &identity.version, &fingerprint);
    let record = InstallationRecord {
      name: identity.name.clone(),
      version: identity.version.clone(),
      options: identity.options.clone(),
      fingerprint,
      root: root.clone(),
      files,
      runtime_dependencies: details.runtime_dependencies,
      source_digest: identity.source_digest.clone(),
      revision: identity.revision.clone(),
      content_hash,
      keg_only: details.keg_only,
      poured_from_bottle: details.poured_from_bottle,
      installed_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default(),
    };

    let receipt = staging.path().join(INSTALL_RECEIPT);
    let content = serde_json::to_string_pretty(&record).map_err(|e| LayoutError::Receipt {
      path: receipt.clone(),
      message: e.to_string(),
    })?;
    fs::write(&receipt, content).at(&receipt)?;

    if root.symlink_metadata().is_ok() {
      debug!(keg = %root.display(), "removing unregistered keg");
      fs::remove_dir_all(&root).at(&root)?;
    }

    let staged = staging.dir.keep();
    if let Err(source) = fs::rename(&staged, &root) {
      let _ = fs::remove_dir_all(&staged);
      return Err(LayoutError::Io { path: root, source });
    }

    info!(formula = %record.name, keg = %root.display(), "promoted keg");
    Ok(record)
  }

  /// Point `opt/<name>` at `keg`, replacing any previous alias atomically.
  pub fn set_opt(&self, name: &str, keg: &Path) -> Result<PathBuf, LayoutError> {
    let opt = self.opt_path(name);
    let opt_dir = self.prefix.join(OPT_DIR);
    fs::create_dir_all(&opt_dir).at(&opt_dir)?;

    let temp = opt_dir.join(format!(".{}.tmp-{}", name, std::process::id()));
    let _ = fs::remove_file(&temp);
    symlink(keg, &temp).at(&temp)?;
    fs::rename(&temp, &opt).at(&opt)?;

    debug!(formula = name, target = %keg.display(), "switched opt alias");
    Ok(opt)
  }

  /// Link the entries of a keg into the shared prefix.
  ///
  /// All targets are checked before anything is touched. Links owned by any
  /// keg of the same formula are replaced; anything else is a conflict.
  pub fn link(&self, record: &InstallationRecord) -> Result<Vec<PathBuf>, LayoutError> {
    let owner = self.formula_dir(&record.name);
    let mut plan = Vec::new();

    for dir in LINKED_DIRS {
      let source_root = record.root.join(dir);
      if !source_root.is_dir() {
        continue;
      }
      for entry in WalkDir::new(&source_root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(&source_root, e))?;
        if entry.file_type().is_dir() {
          continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&record.root) else {
          continue;
        };
        let target = self.prefix.join(relative);
        check_link_target(&record.name, &target, &owner)?;
        plan.push((entry.path().to_path_buf(), target));
      }
    }

    self.unlink(&record.name)?;

    let mut linked = Vec::with_capacity(plan.len());
    for (source, target) in plan {
      if let Err(e) = create_link(&source, &target) {
        remove_links(&linked);
        return Err(e);
      }
      linked.push(target);
    }

    info!(formula = %record.name, links = linked.len(), "linked keg");
    Ok(linked)
  }

  /// Remove `opt/<name>` if it exists.
  pub fn remove_opt(&self, name: &str) -> Result<(), LayoutError> {
    let opt = self.opt_path(name);
    match fs::remove_file(&opt) {
      Err(e) if e.kind() != io::ErrorKind::NotFound => Err::<(), _>(e).at(&opt),
      _ => Ok(()),
    }
  }

  /// Remove every link in the shared prefix that points into a keg of `name`.
  pub fn unlink(&self, name: &str) -> Result<usize, LayoutError> {
    let owner = self.formula_dir(name);
    let mut removed = 0;

    for dir in LINKED_DIRS {
      let root = self.prefix.join(dir);
      if !root.is_dir() {
        continue;
      }
      for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(&root, e))?;
        if !entry.path_is_symlink() {
          continue;
        }
        if let Ok(dest) = fs::read_link(entry.path())
          && dest.starts_with(&owner)
        {
          fs::remove_file(entry.path()).at(entry.path())?;
          removed += 1;
        }
      }
    }

    if removed > 0 {
      debug!(formula = name, removed, "removed stale links");
    }
    Ok(removed)
  }

  /// Whether the keg of `record` still holds exactly what was promoted.
  pub fn verify(&self, record: &InstallationRecord) -> Result<bool, LayoutError> {
    let current = hash_directory(&record.root, &[INSTALL_RECEIPT])?;
    Ok(current.0 == record.content_hash)
  }

  /// Read the receipt of an installed keg.
  pub fn read_receipt(&self, keg: &Path) -> Result<InstallationRecord, LayoutError> {
    let path = keg.join(INSTALL_RECEIPT);
    let content = fs::read_to_string(&path).at(&path)?;
    serde_json::from_str(&content).map_err(|e| LayoutError::Receipt {
      path,
      message: e.to_string(),
    })
  }
}

fn create_link(source: &Path, target: &Path) -> Result<(), LayoutError> {
  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent).at(parent)?;
  }
  symlink(source, target).at(target)
}

/// Best-effort removal of links created by an aborted [`Layout::link`].
fn remove_links(links: &[PathBuf]) {
  for link in links {
    if let Err(e) = fs::remove_file(link) {
      warn!(link = %link.display(), error = %e, "failed to remove partial link");
    }
  }
}

fn check_link_target(formula: &str, target: &Path, owner: &Path) -> Result<(), LayoutError> {
  let Ok(meta) = target.symlink_metadata() else {
    return Ok(());
  };
  if meta.file_type().is_symlink() {
    let dest = fs::read_link(target).at(target)?;
    if dest.starts_with(owner) {
      return Ok(());
    }
    return Err(LayoutError::LinkConflict {
      formula: formula.to_string(),
      path: target.to_path_buf(),
      existing: format!("symlink to {}", dest.display()),
    });
  }
  Err(LayoutError::LinkConflict {
    formula: formula.to_string(),
    path: target.to_path_buf(),
    existing: if meta.is_dir() { "directory" } else { "file" }.to_string(),
  })
}

/// Files and symlinks of a keg, relative and sorted, excluding the receipt.
fn keg_files(root: &Path) -> Result<Vec<PathBuf>, LayoutError> {
  let mut files = Vec::new();
  for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(|e| walk_error(root, e))?;
    if entry.file_type().is_dir() {
      continue;
    }
    if let Ok(relative) = entry.path().strip_prefix(root)
      && relative != Path::new(INSTALL_RECEIPT)
    {
      files.push(relative.to_path_buf());
    }
  }
  Ok(files)
}

fn walk_error(root: &Path, err: walkdir::Error) -> LayoutError {
  LayoutError::Io {
    path: err.path().unwrap_or(root).to_path_buf(),
    source: err.into(),
  }
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  if original.is_dir() {
    std::os::windows::fs::symlink_dir(original, link)
  } else {
    std::os::windows::fs::symlink_file(original, link)
  }
}
