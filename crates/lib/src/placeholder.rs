//! Placeholder parsing and substitution for scripted build steps.
//!
//! Descriptor steps cannot know install paths or the resolved version when the
//! formula is written. They reference them through placeholders which are
//! substituted against the live `BuildContext` when the step runs.
//!
//! # Placeholder Formats
//!
//! - `$${prefix}`, `$${bin}`, `$${lib}`, `$${share}`, ... - a named install path
//! - `$${version}` - the version being built
//! - `$${name}` - the formula name
//! - `$${buildpath}` - the build workspace
//! - `$${jobs}` - the make job count
//! - `$${opt:<formula>}` - the opt alias of an installed dependency
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use cellar_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${bin}/foo:$HOME").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Path("bin".to_string())),
//!     Segment::Literal("/foo:$HOME".to_string()),
//! ]);
//! ```

use thiserror::Error;

/// Install path names accepted by `$${<path>}`.
pub const PATH_NAMES: &[&str] = &[
  "prefix",
  "bin",
  "sbin",
  "lib",
  "libexec",
  "include",
  "share",
  "doc",
  "info",
  "man",
  "man1",
  "man2",
  "man3",
  "man4",
  "man5",
  "man6",
  "man7",
  "man8",
  "frameworks",
  "etc",
  "var",
  "bash_completion",
  "zsh_completion",
  "fish_completion",
];

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${bin}` and friends
  Path(String),

  Version,

  Name,

  /// `$${buildpath}` - the workspace the build runs in
  BuildPath,

  Jobs,

  /// `$${opt:<formula>}`
  Opt(String),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A placeholder to be resolved
  Placeholder(Placeholder),
}

/// Errors that can occur during placeholder parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("no opt alias for '{0}'")]
  UnresolvedOpt(String),
}

/// Resolves placeholder values during step execution.
pub trait Resolver {
  fn resolve_path(&self, name: &str) -> Result<String, PlaceholderError>;

  fn resolve_version(&self) -> &str;

  fn resolve_name(&self) -> &str;

  fn resolve_buildpath(&self) -> String;

  fn resolve_jobs(&self) -> usize;

  fn resolve_opt(&self, formula: &str) -> Result<String, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is unclosed or names something unknown.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();
            match chars.peek() {
              Some((_, '{')) => {
                // $$${ -> literal $${
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
            }
          }
          Some((_, '{')) => {
            chars.next();

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut found_close = false;
            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              content.push(c);
            }

            if !found_close {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  if let Some((kind, rest)) = content.split_once(':') {
    return match kind {
      "opt" if !rest.is_empty() => Ok(Placeholder::Opt(rest.to_string())),
      "opt" => Err(PlaceholderError::Malformed(format!("missing formula in '{content}'"))),
      _ => Err(PlaceholderError::Unknown(content.to_string())),
    };
  }

  match content {
    "version" => Ok(Placeholder::Version),
    "name" => Ok(Placeholder::Name),
    "buildpath" => Ok(Placeholder::BuildPath),
    "jobs" => Ok(Placeholder::Jobs),
    path if PATH_NAMES.contains(&path) => Ok(Placeholder::Path(path.to_string())),
    _ => Err(PlaceholderError::Unknown(content.to_string())),
  }
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => match p {
        Placeholder::Path(name) => result.push_str(&resolver.resolve_path(name)?),
        Placeholder::Version => result.push_str(resolver.resolve_version()),
        Placeholder::Name => result.push_str(resolver.resolve_name()),
        Placeholder::BuildPath => result.push_str(&resolver.resolve_buildpath()),
        Placeholder::Jobs => result.push_str(&resolver.resolve_jobs().to_string()),
        Placeholder::Opt(formula) => result.push_str(&resolver.resolve_opt(formula)?),
      },
    }
  }

  Ok(result)
}
