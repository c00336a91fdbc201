//! Shared helpers for install tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cellar_lib::formula::descriptor;
use cellar_lib::platform::{Arch, Os, Platform};
use cellar_lib::util::hash::hash_bytes;
use cellar_lib::{Config, Formula, FormulaRegistry, Installer, PlatformFacts};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value;
use tempfile::TempDir;

pub const NO_FLAGS: &[&str] = &[];

/// Isolated prefix, cache and source directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn prefix(&self) -> PathBuf {
    self.temp.path().join("prefix")
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.temp.path().join(relative)
  }

  pub fn config(&self) -> Config {
    let mut config = Config::from_env()
      .with_prefix(self.prefix())
      .with_cache(self.temp.path().join("cache"))
      .with_parallelism(4);
    config.command_timeout = Duration::from_secs(30);
    config.fetch_timeout = Duration::from_secs(5);
    config.run_tests = false;
    config.build_from_source = false;
    config
  }

  /// Write `<name>-<version>.tar.gz` with every file under a `<name>-<version>/`
  /// top-level directory. Returns the file URL and its sha256.
  pub fn tarball(&self, name: &str, version: &str, files: &[(&str, &str)]) -> (String, String) {
    let top = format!("{}-{}", name, version);
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
      let mut header = tar::Header::new_gnu();
      header.set_size(contents.len() as u64);
      header.set_mode(0o644);
      header.set_cksum();
      builder
        .append_data(&mut header, format!("{}/{}", top, path), contents.as_bytes())
        .unwrap();
    }
    let bytes = builder.into_inner().unwrap().finish().unwrap();

    let dir = self.path("sources");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join(format!("{}.tar.gz", top));
    std::fs::write(&file, &bytes).unwrap();
    (format!("file://{}", file.display()), hash_bytes(&bytes).0)
  }

  pub fn installer(&self, formulas: Vec<Formula>) -> Installer {
    self.installer_with(self.config(), formulas)
  }

  pub fn installer_with(&self, config: Config, formulas: Vec<Formula>) -> Installer {
    let mut registry = FormulaRegistry::new();
    for formula in formulas {
      registry.insert(formula).unwrap();
    }
    Installer::open(config, facts(), registry).unwrap()
  }
}

/// Linux x86_64 facts with the host search path, so predicates are stable
/// across hosts while build steps still find their tools.
pub fn facts() -> PlatformFacts {
  let mut facts = PlatformFacts::new(Platform::new(Arch::X86_64, Os::Linux)).with_compilers(Vec::new());
  facts.search_path = std::env::var_os("PATH")
    .map(|p| std::env::split_paths(&p).collect())
    .unwrap_or_default();
  facts
}

pub fn formula(doc: Value) -> Formula {
  descriptor::parse(&doc.to_string()).unwrap()
}

pub fn read(path: &Path) -> String {
  std::fs::read_to_string(path).unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e))
}

/// Names of the keg directories of `name`, ignoring staging leftovers.
pub fn kegs(prefix: &Path, name: &str) -> Vec<String> {
  let dir = prefix.join("Cellar").join(name);
  let Ok(entries) = std::fs::read_dir(&dir) else {
    return Vec::new();
  };
  entries
    .filter_map(|e| e.ok())
    .map(|e| e.file_name().to_string_lossy().into_owned())
    .filter(|n| !n.starts_with('.'))
    .collect()
}
