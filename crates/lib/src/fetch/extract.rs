//! Archive extraction into a build workspace.
//!
//! Supports:
//! - `.tar.gz` / `.tgz`
//! - `.tar`
//! - `.zip`
//!
//! When the extracted tree consists of a single top-level directory, its
//! contents are hoisted into the workspace root.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, info};

use super::FetchError;

/// Archive formats the pipeline can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
  TarGz,
  Tar,
  Zip,
}

impl ArchiveKind {
  /// Detect the archive kind from a file name.
  pub fn detect(name: &str) -> Option<Self> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
      Some(Self::TarGz)
    } else if lower.ends_with(".tar") {
      Some(Self::Tar)
    } else if lower.ends_with(".zip") {
      Some(Self::Zip)
    } else {
      None
    }
  }
}

/// Unpack `archive` into `dest` (which must already exist and be empty),
/// stripping a single top-level directory.
pub fn unpack(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), FetchError> {
  unpack_exact(archive, kind, dest)?;
  hoist_single_directory(dest)?;
  info!(archive = %archive.display(), dest = %dest.display(), "unpacked source");
  Ok(())
}

/// Unpack `archive` into `dest` keeping its tree as is.
pub fn unpack_exact(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), FetchError> {
  let extract_err = |message: String| FetchError::Extract {
    archive: archive.to_path_buf(),
    message,
  };

  match kind {
    ArchiveKind::TarGz => {
      let file = File::open(archive)?;
      Archive::new(GzDecoder::new(BufReader::new(file)))
        .unpack(dest)
        .map_err(|e| extract_err(e.to_string()))?;
    }
    ArchiveKind::Tar => {
      let file = File::open(archive)?;
      Archive::new(BufReader::new(file))
        .unpack(dest)
        .map_err(|e| extract_err(e.to_string()))?;
    }
    ArchiveKind::Zip => unpack_zip(archive, dest).map_err(|e| match e {
      FetchError::Io(io) => extract_err(io.to_string()),
      other => other,
    })?,
  }
  Ok(())
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<(), FetchError> {
  let file = File::open(archive_path)?;
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| FetchError::Extract {
    archive: archive_path.to_path_buf(),
    message: e.to_string(),
  })?;

  for i in 0..archive.len() {
    let mut entry = archive.by_index(i).map_err(|e| FetchError::Extract {
      archive: archive_path.to_path_buf(),
      message: e.to_string(),
    })?;

    let Some(path) = entry.enclosed_name() else {
      return Err(FetchError::Extract {
        archive: archive_path.to_path_buf(),
        message: format!("entry '{}' escapes the workspace", entry.name()),
      });
    };
    let dest_path = dest.join(path);

    if entry.is_dir() {
      fs::create_dir_all(&dest_path)?;
      continue;
    }

    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }
    let mut outfile = File::create(&dest_path)?;
    std::io::copy(&mut entry, &mut outfile)?;

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = entry.unix_mode() {
        fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode))?;
      }
    }
  }

  Ok(())
}

/// If `dir` holds exactly one directory and nothing else, move its children up.
fn hoist_single_directory(dir: &Path) -> Result<(), FetchError> {
  let entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
  let [only] = entries.as_slice() else {
    return Ok(());
  };
  if !only.file_type()?.is_dir() {
    return Ok(());
  }

  let top = only.path();
  debug!(dir = %top.display(), "stripping top-level directory");

  // Rename the top directory first so a child with the same name cannot clash.
  let parked = dir.join(format!(".hoist-{}", std::process::id()));
  fs::rename(&top, &parked)?;
  for child in fs::read_dir(&parked)? {
    let child = child?;
    fs::rename(child.path(), dir.join(child.file_name()))?;
  }
  fs::remove_dir(&parked)?;
  Ok(())
}
