//! Platform detection and the facts formula predicates are evaluated against.

pub mod arch;
pub mod os;
pub mod paths;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use arch::Arch;
pub use os::Os;

/// Platform identifier combining architecture and OS (e.g., "aarch64-darwin")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  /// Create a new platform identifier
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the current platform at runtime
  ///
  /// Returns `None` if the OS or architecture is not supported
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// Returns the platform triple string (e.g., "aarch64-darwin")
  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triple())
  }
}

/// Returns the platform triple for the current system (e.g., "aarch64-darwin")
///
/// Returns `None` if the current platform is not supported
pub fn platform_triple() -> Option<String> {
  Platform::current().map(|p| p.triple())
}

/// A compiler available to builds, in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compiler {
  /// Short name (`clang`, `gcc`, `llvm-gcc`).
  pub name: String,
  /// Vendor build number, when known.
  pub build: Option<u32>,
}

impl Compiler {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      build: None,
    }
  }

  /// Executable names exported as `CC` / `CXX` for this compiler.
  pub fn executables(&self) -> (String, String) {
    match self.name.as_str() {
      "clang" => ("clang".to_string(), "clang++".to_string()),
      "llvm-gcc" => ("llvm-gcc".to_string(), "llvm-g++".to_string()),
      "gcc" => ("gcc".to_string(), "g++".to_string()),
      other => (other.to_string(), other.to_string()),
    }
  }
}

/// Immutable facts about the host, captured once per resolution pass.
///
/// Dependency predicates and requirements only ever see this snapshot, never
/// the live system, so evaluating them twice yields the same answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFacts {
  pub platform: Platform,
  /// OS release (e.g. `14.2` or a kernel version), when known.
  pub os_version: Option<String>,
  /// Compilers in preference order.
  pub compilers: Vec<Compiler>,
  /// Tools known to be present (`xcode`, `fortran`, `python3`, ...).
  pub tools: BTreeSet<String>,
  /// Executable search path used to probe tools not listed in `tools`.
  pub search_path: Vec<PathBuf>,
}

impl PlatformFacts {
  /// Facts for an explicit platform with no tools and the platform's default compilers.
  pub fn new(platform: Platform) -> Self {
    let compilers = match platform.os {
      Os::MacOs => vec![Compiler::new("clang"), Compiler::new("gcc")],
      Os::Linux => vec![Compiler::new("gcc"), Compiler::new("clang")],
    };
    Self {
      platform,
      os_version: None,
      compilers,
      tools: BTreeSet::new(),
      search_path: Vec::new(),
    }
  }

  /// Detect facts for the running host.
  ///
  /// Returns `None` if the current platform is not supported.
  pub fn detect() -> Option<Self> {
    let mut facts = Self::new(Platform::current()?);
    facts.search_path = std::env::var_os("PATH")
      .map(|p| std::env::split_paths(&p).collect())
      .unwrap_or_default();
    Some(facts)
  }

  pub fn with_tool(mut self, tool: &str) -> Self {
    self.tools.insert(tool.to_string());
    self
  }

  pub fn with_compilers(mut self, compilers: Vec<Compiler>) -> Self {
    self.compilers = compilers;
    self
  }

  /// Whether a tool is available, either declared or found on the search path.
  pub fn has_tool(&self, tool: &str) -> bool {
    self.tools.contains(tool) || self.search_path.iter().any(|dir| dir.join(tool).is_file())
  }

  pub fn os(&self) -> Os {
    self.platform.os
  }

  pub fn arch(&self) -> Arch {
    self.platform.arch
  }
}
