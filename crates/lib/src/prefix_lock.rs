//! Advisory lock guarding a prefix against concurrent install sessions.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Lock file location relative to the prefix.
const LOCK_FILE: &str = "var/cellar/prefix.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Readers (`list`, `info`).
  Shared,
  /// Install sessions.
  Exclusive,
}

/// Written into the lock file by the exclusive holder.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub prefix: PathBuf,
}

#[derive(Debug, Error)]
pub enum PrefixLockError {
  #[error(
    "prefix is locked by another process: {command} (PID {pid}, started at unix time {started_at})\n\
     If no cellar process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at: u64,
    lock_path: PathBuf,
  },

  #[error(
    "prefix is locked (lock metadata unreadable)\n\
     If no cellar process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// A held lock; released when dropped.
#[derive(Debug)]
pub struct PrefixLock {
  file: File,
  lock_path: PathBuf,
}

impl PrefixLock {
  /// Take the lock without waiting. Contention is an error naming the holder.
  pub fn acquire(prefix: &Path, mode: LockMode, command: &str) -> Result<Self, PrefixLockError> {
    let lock_path = prefix.join(LOCK_FILE);
    if let Some(parent) = lock_path.parent() {
      std::fs::create_dir_all(parent).map_err(PrefixLockError::CreateDir)?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(PrefixLockError::OpenFile)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(contention_error(&lock_path));
      }
      return Err(PrefixLockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      write_metadata(&file, command, prefix)?;
    }

    debug!(lock = %lock_path.display(), ?mode, "acquired prefix lock");
    Ok(Self { file, lock_path })
  }

  /// Metadata read back through the held handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_metadata(file: &File, command: &str, prefix: &Path) -> Result<(), PrefixLockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    prefix: prefix.to_path_buf(),
  };

  file.set_len(0).map_err(PrefixLockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| PrefixLockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(PrefixLockError::WriteMetadata)?;
  Ok(())
}

fn contention_error(lock_path: &Path) -> PrefixLockError {
  if let Ok(contents) = std::fs::read_to_string(lock_path)
    && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
  {
    return PrefixLockError::Contention {
      command: metadata.command,
      pid: metadata.pid,
      started_at: metadata.started_at_unix,
      lock_path: lock_path.to_path_buf(),
    };
  }

  PrefixLockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _mode: LockMode) -> io::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn exclusive_lock_writes_metadata() {
    let temp = TempDir::new().unwrap();
    let lock = PrefixLock::acquire(temp.path(), LockMode::Exclusive, "cellar install libfoo").unwrap();
    assert!(lock.lock_path().exists());

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.command, "cellar install libfoo");
    assert_eq!(metadata.pid, std::process::id());
    assert_eq!(metadata.prefix, temp.path());
  }

  #[test]
  fn shared_locks_coexist() {
    let temp = TempDir::new().unwrap();
    let _a = PrefixLock::acquire(temp.path(), LockMode::Shared, "list").unwrap();
    let _b = PrefixLock::acquire(temp.path(), LockMode::Shared, "info").unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn second_exclusive_lock_reports_holder() {
    let temp = TempDir::new().unwrap();
    let _held = PrefixLock::acquire(temp.path(), LockMode::Exclusive, "first").unwrap();

    match PrefixLock::acquire(temp.path(), LockMode::Exclusive, "second") {
      Err(PrefixLockError::Contention { command, pid, .. }) => {
        assert_eq!(command, "first");
        assert_eq!(pid, std::process::id());
      }
      other => panic!("expected contention, got {other:?}"),
    }
  }

  #[test]
  fn lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = PrefixLock::acquire(temp.path(), LockMode::Exclusive, "first").unwrap();
    }
    PrefixLock::acquire(temp.path(), LockMode::Exclusive, "second").unwrap();
  }
}
