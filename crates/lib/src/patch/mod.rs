//! Ordered, zero-fuzz patch application.
//!
//! Patches are applied strictly in the order given. Every hunk's context and
//! removed lines must match the current file exactly; a hunk may be found at
//! an offset from its nominal position, never with fuzz. The first failure
//! aborts and reports the patch's index and origin.

pub mod parse;

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::fetch::{FetchError, FetchOptions, Fetcher};
use crate::formula::{DownloadStrategy, PatchSource, PatchSpec, SourceSpec};

use parse::{FilePatch, Hunk};

/// Why a single patch did not apply.
#[derive(Debug, Error)]
pub enum PatchFailure {
  #[error("malformed diff at line {line}: {message}")]
  Malformed { line: usize, message: String },

  #[error("no file patches found")]
  Empty,

  #[error("{path}: hunk #{hunk} does not apply cleanly")]
  HunkFailed { path: String, hunk: usize },

  #[error("{path}: file to patch does not exist")]
  MissingFile { path: String },

  #[error("{path}: file to create already exists")]
  FileExists { path: String },

  #[error("{path}: file to delete is not empty after patching")]
  DeleteNotEmpty { path: String },

  #[error("'{path}' escapes the workspace after stripping {strip} components")]
  UnsafePath { path: String, strip: usize },

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// A failed patch: which one, where it came from and why.
#[derive(Debug, Error)]
#[error("patch #{index} ({origin}) failed: {reason}")]
pub struct PatchError {
  pub index: usize,
  pub origin: String,
  #[source]
  pub reason: PatchFailure,
}

/// Result of applying a patch list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
  pub count: usize,
  /// Workspace-relative paths touched, in application order.
  pub files: Vec<PathBuf>,
}

/// Apply `patches` in order to `workspace`. URL patches are fetched and
/// verified through `fetcher`.
pub async fn apply(patches: &[&PatchSpec], workspace: &Path, fetcher: &Fetcher) -> Result<Applied, PatchError> {
  let mut applied = Applied::default();

  for (index, spec) in patches.iter().enumerate() {
    let origin = spec.origin();
    let fail = |reason: PatchFailure| PatchError {
      index,
      origin: origin.clone(),
      reason,
    };

    let text = load_text(spec, fetcher).await.map_err(fail)?;
    let files = apply_text(&text, spec.strip, workspace).map_err(fail)?;

    info!(index, origin = %origin, files = files.len(), "applied patch");
    applied.files.extend(files);
    applied.count += 1;
  }

  Ok(applied)
}

async fn load_text(spec: &PatchSpec, fetcher: &Fetcher) -> Result<String, PatchFailure> {
  match &spec.source {
    PatchSource::Inline(text) => Ok(text.clone()),
    PatchSource::Url { url, checksum } => {
      let mut source = SourceSpec::new(url.clone()).with_strategy(DownloadStrategy::Nounzip);
      source.checksum = checksum.clone();
      let download = fetcher.download(&source, FetchOptions::default()).await?;
      let bytes = tokio::fs::read(&download.path).await?;
      Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
  }
}

/// Apply the unified diff `text` with strip level `strip`. Returns the touched paths.
pub fn apply_text(text: &str, strip: usize, workspace: &Path) -> Result<Vec<PathBuf>, PatchFailure> {
  let files = parse::parse(text)?;
  let mut touched = Vec::new();

  for file in &files {
    touched.push(apply_file(file, strip, workspace)?);
  }

  Ok(touched)
}

fn strip_path(raw: &str, strip: usize) -> Result<PathBuf, PatchFailure> {
  let unsafe_path = || PatchFailure::UnsafePath {
    path: raw.to_string(),
    strip,
  };
  let stripped: PathBuf = Path::new(raw).components().skip(strip).collect();
  if stripped.as_os_str().is_empty() {
    return Err(unsafe_path());
  }
  if stripped
    .components()
    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
  {
    return Err(unsafe_path());
  }
  Ok(stripped)
}

fn apply_file(file: &FilePatch, strip: usize, workspace: &Path) -> Result<PathBuf, PatchFailure> {
  match (&file.old_path, &file.new_path) {
    (None, Some(new)) => {
      let rel = strip_path(new, strip)?;
      let path = workspace.join(&rel);
      if path.exists() && fs::metadata(&path)?.len() > 0 {
        return Err(PatchFailure::FileExists {
          path: rel.display().to_string(),
        });
      }
      let content = patch_content(&rel, "", &file.hunks)?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::write(&path, content)?;
      debug!(path = %rel.display(), "created file");
      Ok(rel)
    }
    (Some(old), None) => {
      let rel = strip_path(old, strip)?;
      let path = workspace.join(&rel);
      let current = read_existing(&path, &rel)?;
      let content = patch_content(&rel, &current, &file.hunks)?;
      if !content.is_empty() {
        return Err(PatchFailure::DeleteNotEmpty {
          path: rel.display().to_string(),
        });
      }
      fs::remove_file(&path)?;
      debug!(path = %rel.display(), "deleted file");
      Ok(rel)
    }
    (Some(old), Some(new)) => {
      // prefer whichever side names an existing file
      let old_rel = strip_path(old, strip)?;
      let rel = if workspace.join(&old_rel).exists() {
        old_rel
      } else {
        strip_path(new, strip)?
      };
      let path = workspace.join(&rel);
      let current = read_existing(&path, &rel)?;
      let content = patch_content(&rel, &current, &file.hunks)?;
      fs::write(&path, content)?;
      debug!(path = %rel.display(), "patched file");
      Ok(rel)
    }
    (None, None) => Err(PatchFailure::Malformed {
      line: 0,
      message: "both sides are /dev/null".to_string(),
    }),
  }
}

fn read_existing(path: &Path, rel: &Path) -> Result<String, PatchFailure> {
  if !path.is_file() {
    return Err(PatchFailure::MissingFile {
      path: rel.display().to_string(),
    });
  }
  Ok(fs::read_to_string(path)?)
}

/// Apply hunks to `content`, returning the new text.
fn patch_content(rel: &Path, content: &str, hunks: &[Hunk]) -> Result<String, PatchFailure> {
  let eol = line_ending(content);
  let mut trailing_newline = content.is_empty() || content.ends_with('\n');
  let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

  // index of the first line a later hunk may match at
  let mut floor = 0usize;
  // shift between nominal and actual positions so far
  let mut shift: isize = 0;

  for (n, hunk) in hunks.iter().enumerate() {
    let old = hunk.old_lines();
    let new: Vec<String> = hunk.new_lines().into_iter().map(str::to_string).collect();

    let nominal = if hunk.old_len == 0 {
      hunk.old_start
    } else {
      hunk.old_start.saturating_sub(1)
    };
    let guess = (nominal as isize + shift).max(floor as isize) as usize;

    let pos = find_hunk(&lines, &old, guess, floor).ok_or_else(|| PatchFailure::HunkFailed {
      path: rel.display().to_string(),
      hunk: n + 1,
    })?;

    let end = pos + old.len();
    let touches_end = end == lines.len();
    lines.splice(pos..end, new.iter().cloned());

    if touches_end {
      trailing_newline = !hunk.new_no_newline;
    }

    shift = pos as isize - nominal as isize + new.len() as isize - old.len() as isize;
    floor = pos + new.len();
  }

  let mut out = lines.join(eol);
  if trailing_newline && !lines.is_empty() {
    out.push_str(eol);
  }
  Ok(out)
}

/// The terminator of the first line: `\r\n` or `\n`.
fn line_ending(content: &str) -> &'static str {
  match content.find('\n') {
    Some(i) if content[..i].ends_with('\r') => "\r\n",
    _ => "\n",
  }
}

/// Find an exact match of `old` in `lines`, searching outward from `guess`
/// and never before `floor`.
fn find_hunk(lines: &[String], old: &[&str], guess: usize, floor: usize) -> Option<usize> {
  let matches_at = |pos: usize| {
    pos + old.len() <= lines.len() && lines[pos..pos + old.len()].iter().zip(old).all(|(a, b)| a == b)
  };

  let last = lines.len().checked_sub(old.len())?;
  let guess = guess.min(last);

  for distance in 0..=lines.len() {
    let after = guess + distance;
    if after <= last && matches_at(after) {
      return Some(after);
    }
    if distance > 0
      && let Some(before) = guess.checked_sub(distance)
      && before >= floor
      && matches_at(before)
    {
      return Some(before);
    }
    if after > last && guess.checked_sub(distance).is_none_or(|b| b < floor) {
      break;
    }
  }
  None
}
