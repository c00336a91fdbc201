//! Installation registry.
//!
//! The registry is the persisted index of promoted kegs. Each formula maps to
//! its known records, keyed by `<version>_<fingerprint>`, and the key of the
//! active one. Keys are write-once: a record is superseded by a record under a
//! new key, never rewritten.
//!
//! ```text
//! <prefix>/var/cellar/registry.json
//! ```
//!
//! [`InFlight`] deduplicates concurrent builds of the same key within a
//! process: the first caller builds, later callers await its result.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::layout::InstallationRecord;

/// Index location relative to the prefix.
const INDEX_FILE: &str = "var/cellar/registry.json";

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("{name} {key} is already registered")]
  Duplicate { name: String, key: String },

  #[error("failed to read registry {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse registry {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported registry version {0}")]
  UnsupportedVersion(u32),

  #[error("failed to write registry {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FormulaEntry {
  active: Option<String>,
  records: BTreeMap<String, InstallationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Index {
  version: u32,
  formulas: BTreeMap<String, FormulaEntry>,
}

impl Default for Index {
  fn default() -> Self {
    Self {
      version: INDEX_VERSION,
      formulas: BTreeMap::new(),
    }
  }
}

/// Persisted index of installed kegs for one prefix.
#[derive(Debug)]
pub struct Registry {
  path: PathBuf,
  index: Mutex<Index>,
}

impl Registry {
  /// Load the index of `prefix`; a missing file is an empty registry.
  pub fn open(prefix: &Path) -> Result<Self, RegistryError> {
    let path = prefix.join(INDEX_FILE);
    let index = match fs::read_to_string(&path) {
      Ok(content) => {
        let index: Index = serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
          path: path.clone(),
          source,
        })?;
        if index.version != INDEX_VERSION {
          return Err(RegistryError::UnsupportedVersion(index.version));
        }
        index
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Index::default(),
      Err(source) => return Err(RegistryError::Read { path, source }),
    };

    debug!(path = %path.display(), formulas = index.formulas.len(), "opened registry");
    Ok(Self {
      path,
      index: Mutex::new(index),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Index> {
    self.index.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, name: &str, key: &str) -> Option<InstallationRecord> {
    self.lock().formulas.get(name)?.records.get(key).cloned()
  }

  pub fn contains(&self, name: &str, key: &str) -> bool {
    self.get(name, key).is_some()
  }

  /// The record `opt/<name>` points at.
  pub fn active(&self, name: &str) -> Option<InstallationRecord> {
    let index = self.lock();
    let entry = index.formulas.get(name)?;
    entry.records.get(entry.active.as_ref()?).cloned()
  }

  /// Every known record of `name`, ordered by key.
  pub fn records(&self, name: &str) -> Vec<InstallationRecord> {
    self
      .lock()
      .formulas
      .get(name)
      .map(|e| e.records.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Active records of every installed formula, by name.
  pub fn installed(&self) -> Vec<InstallationRecord> {
    self
      .lock()
      .formulas
      .values()
      .filter_map(|e| e.records.get(e.active.as_ref()?).cloned())
      .collect()
  }

  /// Register `record` and make it the active one. The index is written
  /// before the in-memory view changes.
  pub fn promote(&self, record: &InstallationRecord) -> Result<(), RegistryError> {
    let key = record.key();
    let mut index = self.lock();

    if index
      .formulas
      .get(&record.name)
      .is_some_and(|e| e.records.contains_key(&key))
    {
      return Err(RegistryError::Duplicate {
        name: record.name.clone(),
        key,
      });
    }

    let mut next = index.clone();
    let entry = next.formulas.entry(record.name.clone()).or_default();
    entry.records.insert(key.clone(), record.clone());
    entry.active = Some(key.clone());

    self.save(&next)?;
    *index = next;

    info!(formula = %record.name, key = %key, "registered installation");
    Ok(())
  }

  /// Write to a temp file, then rename over the index.
  fn save(&self, index: &Index) -> Result<(), RegistryError> {
    let write_err = |source| RegistryError::Write {
      path: self.path.clone(),
      source,
    };
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).map_err(write_err)?;
    }
    let temp = self.path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(index).map_err(|e| write_err(io::Error::other(e)))?;
    fs::write(&temp, content).map_err(write_err)?;
    fs::rename(&temp, &self.path).map_err(write_err)?;
    Ok(())
  }
}

/// Process-wide deduplication of work by key.
///
/// For concurrent callers with the same key exactly one runs its closure;
/// the others await the same cell and receive a clone of the result,
/// errors included. The key is released once the run finishes, so a later
/// request starts afresh (and should find the registered result).
#[derive(Debug)]
pub struct InFlight<K, V> {
  cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for InFlight<K, V> {
  fn default() -> Self {
    Self {
      cells: Mutex::new(HashMap::new()),
    }
  }
}

impl<K, V> InFlight<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `work` for `key` unless a run is already in flight.
  ///
  /// Returns the value and whether this caller did the work.
  pub async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = V>,
  {
    let cell = {
      let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
      cells.entry(key.clone()).or_default().clone()
    };

    let ran = AtomicBool::new(false);
    let flag = &ran;
    let value = cell
      .get_or_init(move || async move {
        flag.store(true, Ordering::SeqCst);
        work().await
      })
      .await
      .clone();

    let leader = ran.load(Ordering::SeqCst);
    if leader {
      let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
      if cells.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
        cells.remove(&key);
      }
    }
    (value, leader)
  }

  pub fn in_flight(&self) -> usize {
    self.cells.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}
