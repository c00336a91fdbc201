//! Version detection from source URLs and git tags.

const ARCHIVE_SUFFIXES: &[&str] = &[
  ".tar.gz", ".tar.bz2", ".tar.xz", ".tar.zst", ".tgz", ".tbz", ".tbz2", ".txz", ".tar", ".zip", ".gz", ".bz2",
  ".xz", ".git",
];

/// Detect a version from a git tag (`v1.2.3`, `release-1.2`, `1.2.3`).
pub fn from_tag(tag: &str) -> Option<String> {
  version_in_stem(tag)
}

/// Detect a version from the file name of a source URL.
///
/// `https://x.org/foo-1.2.3.tar.gz` gives `1.2.3`; `.../archive/v2.0.zip` gives `2.0`.
pub fn from_url(url: &str) -> Option<String> {
  let path = url.split(['?', '#']).next().unwrap_or(url);
  let file = path.trim_end_matches('/').rsplit('/').next()?;

  let lower = file.to_ascii_lowercase();
  let stem = ARCHIVE_SUFFIXES
    .iter()
    .find(|suffix| lower.ends_with(*suffix))
    .map(|suffix| &file[..file.len() - suffix.len()])
    .unwrap_or(file);

  version_in_stem(stem)
}

fn version_in_stem(stem: &str) -> Option<String> {
  let bytes = stem.as_bytes();
  let starts_version = |i: usize| -> Option<usize> {
    match bytes.get(i) {
      Some(b) if b.is_ascii_digit() => Some(i),
      Some(b'v') if bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) => Some(i + 1),
      _ => None,
    }
  };

  if let Some(start) = starts_version(0) {
    return Some(stem[start..].to_string());
  }

  (1..bytes.len())
    .filter(|&i| matches!(bytes[i - 1], b'-' | b'_'))
    .find_map(starts_version)
    .map(|start| stem[start..].to_string())
}
