//! Prebuilt artifacts ("bottles").
//!
//! A bottle is an archive of a finished keg for one platform and one option
//! set. Its root is the keg root. Bottles are an optional input: when one
//! matches, it is verified and poured into the staging keg instead of
//! fetching, patching and building.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::fetch::extract::{self, ArchiveKind};
use crate::fetch::{FetchError, FetchOptions, Fetcher, url_to_filename};
use crate::formula::{Formula, SourceSpec, Variant};
use crate::options::{self, ResolvedOptions};
use crate::platform::{Platform, PlatformFacts};
use crate::util::hash::Checksum;

#[derive(Debug, Error)]
pub enum BottleError {
  #[error("bottle {url} is not an archive")]
  NotAnArchive { url: String },

  #[error(transparent)]
  Fetch(#[from] FetchError),
}

/// A prebuilt keg payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrebuiltArtifact {
  pub name: String,
  pub version: String,
  /// Option fingerprint the payload was built with.
  pub fingerprint: String,
  pub platform: Platform,
  pub url: String,
  pub checksum: Checksum,
}

/// Result of pouring a bottle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poured {
  pub root: PathBuf,
  pub url: String,
  pub digest: String,
}

/// Pick a payload for `formula` resolved as `resolved`.
///
/// Caller-supplied artifacts must match name, version, platform and option
/// fingerprint. The formula's own `bottle` block only covers the stable
/// variant built with default options.
pub fn select(
  formula: &Formula,
  version: &str,
  resolved: &ResolvedOptions,
  facts: &PlatformFacts,
  supplied: &[PrebuiltArtifact],
) -> Option<PrebuiltArtifact> {
  let fingerprint = resolved.fingerprint();

  if let Some(artifact) = supplied.iter().find(|a| {
    a.name == formula.name && a.version == version && a.platform == facts.platform && a.fingerprint == fingerprint
  }) {
    debug!(formula = %formula.name, url = %artifact.url, "matched supplied bottle");
    return Some(artifact.clone());
  }

  let spec = formula.bottle.as_ref()?;
  if resolved.variant != Variant::Stable {
    return None;
  }
  let no_flags: [&str; 0] = [];
  let defaults = options::resolve(formula, &no_flags, facts).ok()?;
  if defaults.fingerprint() != fingerprint {
    debug!(formula = %formula.name, "options differ from defaults, not using bottle");
    return None;
  }

  let entry = spec.entries.iter().find(|e| e.platform == facts.platform)?;
  debug!(formula = %formula.name, url = %entry.url, revision = spec.revision, "matched formula bottle");
  Some(PrebuiltArtifact {
    name: formula.name.clone(),
    version: version.to_string(),
    fingerprint,
    platform: entry.platform,
    url: entry.url.clone(),
    checksum: entry.checksum.clone(),
  })
}

/// Download and verify `artifact`, then unpack it into `keg_root`.
pub async fn pour(artifact: &PrebuiltArtifact, keg_root: &Path, fetcher: &Fetcher) -> Result<Poured, BottleError> {
  let source = SourceSpec::new(artifact.url.clone()).with_checksum(artifact.checksum.clone());
  let download = fetcher.download(&source, FetchOptions::default()).await?;

  let Some(kind) = ArchiveKind::detect(&url_to_filename(&download.url)) else {
    return Err(BottleError::NotAnArchive {
      url: download.url.clone(),
    });
  };

  tokio::fs::create_dir_all(keg_root).await.map_err(FetchError::Io)?;
  let archive = download.path.clone();
  let dest = keg_root.to_path_buf();
  tokio::task::spawn_blocking(move || extract::unpack_exact(&archive, kind, &dest))
    .await
    .map_err(|e| FetchError::Io(std::io::Error::other(e)))??;

  info!(formula = %artifact.name, version = %artifact.version, url = %download.url, "poured bottle");
  Ok(Poured {
    root: keg_root.to_path_buf(),
    url: download.url,
    digest: download.digest,
  })
}
