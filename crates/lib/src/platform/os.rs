use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating system variants a formula can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Os {
  #[serde(rename = "linux")]
  Linux,
  #[serde(rename = "darwin", alias = "macos")]
  MacOs,
}

impl Os {
  /// Detect the current operating system at runtime
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::MacOs),
      _ => None,
    }
  }

  /// Returns the lowercase string identifier for this OS
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::MacOs => "darwin",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "linux" => Some(Self::Linux),
      "darwin" | "macos" => Some(Self::MacOs),
      _ => None,
    }
  }

  /// Whether fat (multi-architecture) binaries can be produced on this OS.
  pub fn supports_universal(&self) -> bool {
    matches!(self, Self::MacOs)
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
