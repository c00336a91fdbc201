//! Named install locations inside a keg.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Install locations handed to a procedure.
///
/// Everything lives under `prefix`, the keg being built, so a failed build
/// leaves nothing behind in the shared prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPaths {
  pub prefix: PathBuf,
  pub bin: PathBuf,
  pub sbin: PathBuf,
  pub lib: PathBuf,
  pub libexec: PathBuf,
  pub include: PathBuf,
  pub share: PathBuf,
  pub doc: PathBuf,
  pub info: PathBuf,
  pub man: PathBuf,
  pub frameworks: PathBuf,
  pub etc: PathBuf,
  pub var: PathBuf,
  pub bash_completion: PathBuf,
  pub zsh_completion: PathBuf,
  pub fish_completion: PathBuf,
}

impl InstallPaths {
  pub fn new(keg: &Path, name: &str) -> Self {
    let share = keg.join("share");
    Self {
      prefix: keg.to_path_buf(),
      bin: keg.join("bin"),
      sbin: keg.join("sbin"),
      lib: keg.join("lib"),
      libexec: keg.join("libexec"),
      include: keg.join("include"),
      doc: share.join("doc").join(name),
      info: share.join("info"),
      man: share.join("man"),
      frameworks: keg.join("Frameworks"),
      etc: keg.join("etc"),
      var: keg.join("var"),
      bash_completion: keg.join("etc").join("bash_completion.d"),
      zsh_completion: share.join("zsh").join("site-functions"),
      fish_completion: share.join("fish").join("vendor_completions.d"),
      share,
    }
  }

  /// `man/man<section>`.
  pub fn man_section(&self, section: u8) -> PathBuf {
    self.man.join(format!("man{}", section))
  }

  /// Look up a location by its placeholder name (`bin`, `man3`, ...).
  pub fn get(&self, name: &str) -> Option<PathBuf> {
    let path = match name {
      "prefix" => &self.prefix,
      "bin" => &self.bin,
      "sbin" => &self.sbin,
      "lib" => &self.lib,
      "libexec" => &self.libexec,
      "include" => &self.include,
      "share" => &self.share,
      "doc" => &self.doc,
      "info" => &self.info,
      "man" => &self.man,
      "frameworks" => &self.frameworks,
      "etc" => &self.etc,
      "var" => &self.var,
      "bash_completion" => &self.bash_completion,
      "zsh_completion" => &self.zsh_completion,
      "fish_completion" => &self.fish_completion,
      other => {
        let section = other.strip_prefix("man")?.parse::<u8>().ok()?;
        return (1..=8).contains(&section).then(|| self.man_section(section));
      }
    };
    Some(path.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::placeholder::PATH_NAMES;

  #[test]
  fn layout_matches_conventions() {
    let paths = InstallPaths::new(Path::new("/p/Cellar/foo/1.0_abc"), "foo");
    assert_eq!(paths.bin, PathBuf::from("/p/Cellar/foo/1.0_abc/bin"));
    assert_eq!(paths.doc, PathBuf::from("/p/Cellar/foo/1.0_abc/share/doc/foo"));
    assert_eq!(paths.etc, PathBuf::from("/p/Cellar/foo/1.0_abc/etc"));
    assert_eq!(paths.var, PathBuf::from("/p/Cellar/foo/1.0_abc/var"));
    assert_eq!(paths.man_section(3), PathBuf::from("/p/Cellar/foo/1.0_abc/share/man/man3"));
    assert_eq!(
      paths.bash_completion,
      PathBuf::from("/p/Cellar/foo/1.0_abc/etc/bash_completion.d")
    );
  }

  #[test]
  fn every_placeholder_name_resolves() {
    let paths = InstallPaths::new(Path::new("/k"), "foo");
    for name in PATH_NAMES {
      assert!(paths.get(name).is_some(), "{name} did not resolve");
    }
    assert_eq!(paths.get("man9"), None);
    assert_eq!(paths.get("nope"), None);
  }
}
