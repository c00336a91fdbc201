//! Hashing utilities for source verification, fingerprints and keg contents.
//!
//! This module provides:
//! - `Checksum`: a declared digest (`sha256:<hex>`, legacy `sha1:<hex>`) and its verification
//! - `Hashable`: truncated SHA-256 fingerprints of serializable values
//! - `ContentHash` + `hash_directory()` / `hash_file()` / `hash_bytes()`

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::consts::FINGERPRINT_LEN;

pub type HashError = serde_json::Error;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
  Sha256,
  /// Accepted for legacy descriptors only.
  Sha1,
}

impl DigestAlgorithm {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Sha256 => "sha256",
      Self::Sha1 => "sha1",
    }
  }

  fn hex_len(&self) -> usize {
    match self {
      Self::Sha256 => 64,
      Self::Sha1 => 40,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumParseError {
  #[error("unknown digest algorithm '{0}'")]
  UnknownAlgorithm(String),

  #[error("{algo} digest must be {expected} hex characters, got '{value}'")]
  BadLength {
    algo: &'static str,
    expected: usize,
    value: String,
  },

  #[error("digest '{0}' is not hexadecimal")]
  NotHex(String),
}

/// A declared cryptographic digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
  pub algo: DigestAlgorithm,
  pub hex: String,
}

impl Checksum {
  pub fn sha256(hex: &str) -> Result<Self, ChecksumParseError> {
    Self::with_algo(DigestAlgorithm::Sha256, hex)
  }

  pub fn sha1(hex: &str) -> Result<Self, ChecksumParseError> {
    Self::with_algo(DigestAlgorithm::Sha1, hex)
  }

  fn with_algo(algo: DigestAlgorithm, hex: &str) -> Result<Self, ChecksumParseError> {
    let hex = hex.trim().to_ascii_lowercase();
    if hex.len() != algo.hex_len() {
      return Err(ChecksumParseError::BadLength {
        algo: algo.as_str(),
        expected: algo.hex_len(),
        value: hex,
      });
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(ChecksumParseError::NotHex(hex));
    }
    Ok(Self { algo, hex })
  }

  /// Parse `sha256:<hex>` / `sha1:<hex>`, or a bare hex string whose length
  /// identifies the algorithm.
  pub fn parse(s: &str) -> Result<Self, ChecksumParseError> {
    match s.split_once(':') {
      Some(("sha256", hex)) => Self::sha256(hex),
      Some(("sha1", hex)) => Self::sha1(hex),
      Some((algo, _)) => Err(ChecksumParseError::UnknownAlgorithm(algo.to_string())),
      None if s.len() == 40 => Self::sha1(s),
      None => Self::sha256(s),
    }
  }

  /// Hash `data` with this checksum's algorithm, returning lowercase hex.
  pub fn compute(&self, data: &[u8]) -> String {
    digest_hex(self.algo, data)
  }

  /// Whether `data` hashes to this checksum.
  pub fn matches(&self, data: &[u8]) -> bool {
    self.compute(data) == self.hex
  }

  pub fn is_legacy(&self) -> bool {
    self.algo == DigestAlgorithm::Sha1
  }
}

impl fmt::Display for Checksum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.algo.as_str(), self.hex)
  }
}

impl TryFrom<String> for Checksum {
  type Error = ChecksumParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<Checksum> for String {
  fn from(value: Checksum) -> Self {
    value.to_string()
  }
}

/// Hash bytes with the given algorithm.
pub fn digest_hex(algo: DigestAlgorithm, data: &[u8]) -> String {
  match algo {
    DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
    DigestAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
  }
}

/// A truncated hash identifying a serializable value (option sets, artifact keys).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  /// Truncated SHA-256 of the JSON serialization.
  ///
  /// Implementors must serialize deterministically (ordered maps and sets).
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    let full = hex::encode(Sha256::digest(serialized.as_bytes()));
    Ok(ObjectHash(full[..FINGERPRINT_LEN].to_string()))
  }
}

/// A full 64-character SHA256 hash for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during directory hashing.
#[derive(Debug, Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure and symlink targets,
/// never timestamps or permissions. Entries named in `exclude` are skipped.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents with SHA-256.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut file = fs::File::open(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes with SHA-256.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}
