//! Git checkouts for `git`-strategy sources.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use gix::refs::transaction::{Change, LogChange, PreviousValue, RefEdit};
use gix::refs::{FullName, Target};
use tracing::{debug, info};

use super::FetchError;

/// Shortest abbreviated revision accepted in a descriptor.
const MIN_REVISION_LEN: usize = 7;

/// Which ref of a repository to check out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitRef<'a> {
  pub tag: Option<&'a str>,
  pub branch: Option<&'a str>,
  /// Commit the checkout must resolve to (full or abbreviated hash).
  pub revision: Option<&'a str>,
}

/// Clone `url` into `dest` and return the checked-out commit id.
///
/// A declared revision without a tag or branch is checked out detached;
/// with a tag or branch it must match the commit that ref points to.
/// Blocking; call from `spawn_blocking`. Setting `interrupt` aborts the
/// transfer.
pub fn checkout(url: &str, dest: &Path, reference: &GitRef<'_>, interrupt: &AtomicBool) -> Result<String, FetchError> {
  let git_err = |message: String| FetchError::Git {
    url: url.to_string(),
    message,
  };

  info!(url, dest = %dest.display(), tag = ?reference.tag, branch = ?reference.branch, "cloning repository");

  let mut prepared = gix::prepare_clone(url, dest).map_err(|e| git_err(e.to_string()))?;
  let named = reference.tag.or(reference.branch);
  if let Some(name) = named {
    prepared = prepared
      .with_ref_name(Some(name))
      .map_err(|e| git_err(format!("invalid ref '{}': {}", name, e)))?;
  }

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, interrupt)
    .map_err(|e| git_err(e.to_string()))?;

  if named.is_none()
    && let Some(revision) = reference.revision
    && revision.len() >= MIN_REVISION_LEN
  {
    detach_head(checkout.repo(), revision).map_err(git_err)?;
  }

  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, interrupt)
    .map_err(|e| git_err(e.to_string()))?;

  let mut head = repo.head().map_err(|e| git_err(e.to_string()))?;
  let commit = head.peel_to_commit().map_err(|e| git_err(e.to_string()))?;
  let resolved = commit.id.to_string();
  debug!(url, rev = %resolved, "resolved revision");

  if let Some(expected) = reference.revision {
    verify_revision(url, expected, &resolved)?;
  }

  Ok(resolved)
}

/// Point `HEAD` of a fresh clone at `revision` so the worktree checkout
/// materializes that commit.
fn detach_head(repo: &gix::Repository, revision: &str) -> Result<(), String> {
  let id = repo
    .rev_parse_single(revision)
    .map_err(|e| format!("revision '{}' not found: {}", revision, e))?
    .detach();

  let name: FullName = "HEAD".try_into().map_err(|e| format!("{}", e))?;
  repo
    .edit_reference(RefEdit {
      change: Change::Update {
        log: LogChange::default(),
        expected: PreviousValue::Any,
        new: Target::Object(id),
      },
      name,
      deref: false,
    })
    .map_err(|e| format!("failed to detach HEAD at {}: {}", revision, e))?;

  debug!(rev = %id, "detached HEAD at declared revision");
  Ok(())
}

/// Check a resolved commit id against a declared (possibly abbreviated) one.
pub fn verify_revision(url: &str, expected: &str, actual: &str) -> Result<(), FetchError> {
  let expected_lower = expected.to_ascii_lowercase();
  if expected_lower.len() >= MIN_REVISION_LEN && actual.starts_with(&expected_lower) {
    Ok(())
  } else {
    Err(FetchError::RevisionMismatch {
      url: url.to_string(),
      expected: expected.to_string(),
      actual: actual.to_string(),
    })
  }
}
