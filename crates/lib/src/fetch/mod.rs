//! Source fetch and verification pipeline.
//!
//! [`Fetcher::fetch`] retrieves a [`SourceSpec`] with its declared strategy,
//! verifies the raw bytes against the declared digest (or, for git sources,
//! the checked-out commit against the declared revision) and extracts the
//! result into an empty workspace. Mirrors are attempted in order, but only
//! after transport failures; a digest mismatch stops the pipeline.
//!
//! # Download cache
//!
//! Verified downloads are kept at `<downloads>/<digest-prefix>--<filename>`
//! and reused as long as their bytes still match the declared digest.

pub mod extract;
pub mod git;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::formula::{DownloadStrategy, SourceSpec};
use crate::util::hash::{Checksum, DigestAlgorithm, digest_hex};

use extract::ArchiveKind;
use git::GitRef;

/// Errors raised while retrieving sources.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("transport error fetching {url}: {message}")]
  Transport { url: String, message: String },

  #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
  DigestMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("no digest declared for {url}")]
  MissingDigest { url: String },

  #[error("failed to extract {archive}: {message}")]
  Extract { archive: PathBuf, message: String },

  #[error("git error for {url}: {message}")]
  Git { url: String, message: String },

  #[error("{url} resolved to {actual}, expected revision {expected}")]
  RevisionMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl FetchError {
  /// Whether the next mirror should be attempted after this error.
  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Transport { .. })
  }
}

/// Per-fetch switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
  /// Skip digest verification (moving `head` sources).
  pub skip_verification: bool,
  /// Never extract, regardless of file type.
  pub no_extract: bool,
}

/// A source that passed verification and sits in its workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSource {
  /// Workspace the source was extracted or checked out into.
  pub workspace: PathBuf,
  /// The URL that was actually used (primary or mirror).
  pub url: String,
  /// Verified digest (`sha256:<hex>`), or the digest of unverified bytes.
  pub digest: Option<String>,
  /// Commit id for git sources.
  pub revision: Option<String>,
  /// Downloaded file staged without extraction, if any.
  pub staged_file: Option<PathBuf>,
}

/// A verified file in the download cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
  pub path: PathBuf,
  pub url: String,
  pub digest: String,
}

/// Retrieves and verifies sources.
#[derive(Debug, Clone)]
pub struct Fetcher {
  client: reqwest::Client,
  downloads_dir: PathBuf,
  timeout: Duration,
}

impl Fetcher {
  pub fn new(config: &Config) -> Result<Self, FetchError> {
    Self::with_downloads_dir(config.downloads_dir(), config.fetch_timeout)
  }

  pub fn with_downloads_dir(downloads_dir: PathBuf, timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("cellar/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| FetchError::Transport {
        url: String::new(),
        message: e.to_string(),
      })?;
    Ok(Self {
      client,
      downloads_dir,
      timeout,
    })
  }

  pub fn downloads_dir(&self) -> &Path {
    &self.downloads_dir
  }

  /// Fetch `source` into `workspace`, which is emptied first.
  pub async fn fetch(
    &self,
    source: &SourceSpec,
    workspace: &Path,
    options: FetchOptions,
  ) -> Result<VerifiedSource, FetchError> {
    prepare_workspace(workspace).await?;

    if source.strategy == DownloadStrategy::Git {
      return self.fetch_git(source, workspace, options).await;
    }

    let download = self.download(source, options).await?;
    let file_name = url_to_filename(&download.url);

    let kind = match source.strategy {
      DownloadStrategy::Nounzip => None,
      _ if options.no_extract => None,
      _ => ArchiveKind::detect(&file_name),
    };

    let staged_file = match kind {
      Some(kind) => {
        let archive = download.path.clone();
        let dest = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || extract::unpack(&archive, kind, &dest))
          .await
          .map_err(|e| FetchError::Io(std::io::Error::other(e)))??;
        None
      }
      None => {
        let dest = workspace.join(&file_name);
        fs::copy(&download.path, &dest).await?;
        debug!(file = %dest.display(), "staged source without extraction");
        Some(dest)
      }
    };

    Ok(VerifiedSource {
      workspace: workspace.to_path_buf(),
      url: download.url,
      digest: Some(download.digest),
      revision: None,
      staged_file,
    })
  }

  async fn fetch_git(
    &self,
    source: &SourceSpec,
    workspace: &Path,
    options: FetchOptions,
  ) -> Result<VerifiedSource, FetchError> {
    let mut last_err = None;

    for url in source.urls() {
      let url_owned = url.to_string();
      let dest = workspace.to_path_buf();
      let tag = source.tag.clone();
      let branch = source.branch.clone();
      let revision = if options.skip_verification {
        None
      } else {
        source.revision.clone()
      };

      // the clone thread checks this flag; a timed-out clone is abandoned
      let interrupt = Arc::new(AtomicBool::new(false));
      let flag = Arc::clone(&interrupt);
      let clone = tokio::task::spawn_blocking(move || {
        let reference = GitRef {
          tag: tag.as_deref(),
          branch: branch.as_deref(),
          revision: revision.as_deref(),
        };
        git::checkout(&url_owned, &dest, &reference, &flag)
      });

      let result = match tokio::time::timeout(self.timeout, clone).await {
        Ok(joined) => joined.map_err(|e| FetchError::Io(std::io::Error::other(e)))?,
        Err(_) => {
          interrupt.store(true, Ordering::Relaxed);
          warn!(url, timeout = ?self.timeout, "git clone timed out");
          return Err(FetchError::Transport {
            url: url.to_string(),
            message: "timed out".to_string(),
          });
        }
      };

      match result {
        Ok(commit) => {
          return Ok(VerifiedSource {
            workspace: workspace.to_path_buf(),
            url: url.to_string(),
            digest: None,
            revision: Some(commit),
            staged_file: None,
          });
        }
        Err(e @ FetchError::Git { .. }) => {
          warn!(url, error = %e, "git clone failed, trying next location");
          prepare_workspace(workspace).await?;
          last_err = Some(e);
        }
        Err(e) => return Err(e),
      }
    }

    Err(last_err.unwrap_or_else(|| FetchError::Git {
      url: source.url.clone(),
      message: "no location to clone from".to_string(),
    }))
  }

  /// Download `source` into the cache and verify it, trying mirrors on transport failure.
  pub async fn download(&self, source: &SourceSpec, options: FetchOptions) -> Result<Download, FetchError> {
    let checksum = match (&source.checksum, options.skip_verification) {
      (_, true) => None,
      (Some(c), false) => Some(c),
      (None, false) => return Err(FetchError::MissingDigest { url: source.url.clone() }),
    };
    if let Some(c) = checksum
      && c.is_legacy()
    {
      warn!(url = %source.url, "verifying with legacy sha1 digest");
    }

    fs::create_dir_all(&self.downloads_dir).await?;

    let mut last_err = None;
    for url in source.urls() {
      match self.download_one(url, source, checksum).await {
        Ok(download) => return Ok(download),
        Err(e) if e.is_transport() => {
          warn!(url, error = %e, "download failed, trying next mirror");
          last_err = Some(e);
        }
        Err(e) => return Err(e),
      }
    }

    Err(last_err.unwrap_or_else(|| FetchError::Transport {
      url: source.url.clone(),
      message: "no URL declared".to_string(),
    }))
  }

  async fn download_one(
    &self,
    url: &str,
    source: &SourceSpec,
    checksum: Option<&Checksum>,
  ) -> Result<Download, FetchError> {
    let dest_path = self.cache_path(url, checksum);

    if let Some(expected) = checksum
      && fs::try_exists(&dest_path).await.unwrap_or(false)
    {
      debug!(path = %dest_path.display(), "checking cached file");
      let cached = fs::read(&dest_path).await?;
      if expected.matches(&cached) {
        info!(path = %dest_path.display(), "using cached file");
        return Ok(Download {
          path: dest_path,
          url: url.to_string(),
          digest: expected.to_string(),
        });
      }
      debug!(path = %dest_path.display(), "cached file no longer matches, re-downloading");
      fs::remove_file(&dest_path).await?;
    }

    info!(url, "fetching URL");
    let bytes = self.read_url(url, source).await?;

    let digest = match checksum {
      Some(expected) => {
        let actual = expected.compute(&bytes);
        if actual != expected.hex {
          return Err(FetchError::DigestMismatch {
            url: url.to_string(),
            expected: expected.to_string(),
            actual: format!("{}:{}", expected.algo.as_str(), actual),
          });
        }
        expected.to_string()
      }
      None => format!("sha256:{}", digest_hex(DigestAlgorithm::Sha256, &bytes)),
    };

    // concurrent downloads of one URL must never expose a partial file
    let partial = tempfile::Builder::new()
      .prefix(".download-")
      .tempfile_in(&self.downloads_dir)?;
    fs::write(partial.path(), &bytes).await?;
    partial.persist(&dest_path).map_err(|e| FetchError::Io(e.error))?;
    info!(path = %dest_path.display(), size = bytes.len(), "download complete");

    Ok(Download {
      path: dest_path,
      url: url.to_string(),
      digest,
    })
  }

  /// Raw bytes behind `url`: `file://` paths are read directly, HTTP(S) uses GET or POST.
  async fn read_url(&self, url: &str, source: &SourceSpec) -> Result<Vec<u8>, FetchError> {
    let transport = |message: String| FetchError::Transport {
      url: url.to_string(),
      message,
    };

    if let Some(path) = url.strip_prefix("file://") {
      return match tokio::time::timeout(self.timeout, fs::read(path)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(transport(e.to_string())),
        Err(_) => Err(transport("timed out".to_string())),
      };
    }

    let request = match source.strategy {
      DownloadStrategy::Post => self.client.post(url).form(&source.post_data),
      _ => self.client.get(url),
    };

    let response = request.send().await.map_err(|e| {
      if e.is_timeout() {
        transport("timed out".to_string())
      } else {
        transport(e.to_string())
      }
    })?;

    if !response.status().is_success() {
      return Err(transport(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| transport(e.to_string()))?;
    Ok(bytes.to_vec())
  }

  fn cache_path(&self, url: &str, checksum: Option<&Checksum>) -> PathBuf {
    let prefix = match checksum {
      Some(c) => c.hex.chars().take(12).collect(),
      None => {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        format!("head-{}", &hex::encode(hasher.finalize())[..12])
      }
    };
    self.downloads_dir.join(format!("{}--{}", prefix, url_to_filename(url)))
  }
}

/// Ensure `workspace` exists and is empty.
pub async fn prepare_workspace(workspace: &Path) -> Result<(), FetchError> {
  if fs::try_exists(workspace).await? {
    let mut entries = fs::read_dir(workspace).await?;
    if entries.next_entry().await?.is_some() {
      debug!(workspace = %workspace.display(), "clearing non-empty workspace");
      fs::remove_dir_all(workspace).await?;
      fs::create_dir_all(workspace).await?;
    }
  } else {
    fs::create_dir_all(workspace).await?;
  }
  Ok(())
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component and sanitizes it. Falls back to hash of URL
/// if no suitable filename can be extracted.
pub fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split('?').next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  format!("download_{}", &hex::encode(hasher.finalize())[..16])
}
