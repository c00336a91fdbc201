//! JSON formula descriptors.
//!
//! One document per formula:
//!
//! ```json
//! {
//!   "name": "libfoo",
//!   "homepage": "https://example.com/libfoo",
//!   "url": "https://example.com/libfoo-1.0.tar.gz",
//!   "sha256": "...",
//!   "head": "https://github.com/example/libfoo.git",
//!   "options": [{"name": "with-bar", "description": "Build with bar support"}],
//!   "dependencies": ["zlib", {"target": "bar", "when": {"with": "bar"}}],
//!   "install": [{"op": "system", "command": "make", "args": ["install", "PREFIX=$${prefix}"]}]
//! }
//! ```
//!
//! The location keys (`url`, `mirrors`, `sha256`/`sha1`, `using`, `tag`,
//! `branch`, `revision`, `data`) may appear at the top level for the stable
//! source, or inside `stable` / `devel` / `head` blocks. A variant may also
//! be given as a bare URL string.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::sandbox::ScriptedProcedure;
use crate::util::hash::Checksum;

use super::{
  BottleSpec, CompilerFailure, Conflict, DepKind, DependencySpec, DownloadStrategy, Formula, FormulaError, KegOnly,
  OptionDecl, PatchSource, PatchSpec, Predicate, Resource, SourceSet, SourceSpec, Target,
};

#[derive(Debug, Default, Deserialize)]
struct LocationDoc {
  #[serde(default)]
  url: Option<String>,
  #[serde(default)]
  mirrors: Vec<String>,
  #[serde(default)]
  sha256: Option<String>,
  #[serde(default)]
  sha1: Option<String>,
  #[serde(default)]
  using: Option<DownloadStrategy>,
  #[serde(default)]
  tag: Option<String>,
  #[serde(default)]
  branch: Option<String>,
  #[serde(default)]
  revision: Option<String>,
  /// Form fields for `post` downloads.
  #[serde(default)]
  data: BTreeMap<String, String>,
}

impl LocationDoc {
  fn is_empty(&self) -> bool {
    self.url.is_none()
  }

  fn into_source(self, what: &str) -> Result<SourceSpec, String> {
    let url = self.url.ok_or_else(|| format!("{} has no url", what))?;
    let checksum = match (self.sha256, self.sha1) {
      (Some(_), Some(_)) => return Err(format!("{} declares both sha256 and sha1", what)),
      (Some(hex), None) => Some(Checksum::sha256(&hex).map_err(|e| format!("{}: {}", what, e))?),
      (None, Some(hex)) => Some(Checksum::sha1(&hex).map_err(|e| format!("{}: {}", what, e))?),
      (None, None) => None,
    };
    let has_vcs_ref = self.tag.is_some() || self.branch.is_some() || self.revision.is_some();
    let strategy = self.using.unwrap_or_else(|| DownloadStrategy::detect(&url, has_vcs_ref));

    Ok(SourceSpec {
      url,
      mirrors: self.mirrors,
      checksum,
      strategy,
      post_data: self.data,
      tag: self.tag,
      branch: self.branch,
      revision: self.revision,
      ..Default::default()
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VariantDoc {
  Url(String),
  Block(Box<VariantBlockDoc>),
}

#[derive(Debug, Deserialize)]
struct VariantBlockDoc {
  #[serde(flatten)]
  location: LocationDoc,
  #[serde(default)]
  version: Option<String>,
  #[serde(default)]
  dependencies: Vec<DependencyDoc>,
  #[serde(default)]
  resources: Vec<ResourceDoc>,
  #[serde(default)]
  patches: Vec<PatchDoc>,
}

impl VariantDoc {
  fn into_source(self, what: &str) -> Result<SourceSpec, String> {
    match self {
      Self::Url(url) => Ok(SourceSpec::new(url)),
      Self::Block(block) => {
        let block = *block;
        let mut source = block.location.into_source(what)?;
        source.version = block.version;
        source.dependencies = block.dependencies.into_iter().map(DependencyDoc::into_spec).collect();
        source.resources = block
          .resources
          .into_iter()
          .map(ResourceDoc::into_resource)
          .collect::<Result<_, _>>()?;
        source.patches = block
          .patches
          .into_iter()
          .map(PatchDoc::into_spec)
          .collect::<Result<_, _>>()?;
        Ok(source)
      }
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OptionDoc {
  Name(String),
  Full {
    name: String,
    #[serde(default)]
    description: String,
  },
}

impl OptionDoc {
  fn into_decl(self) -> OptionDecl {
    match self {
      Self::Name(name) => OptionDecl::new(&name, ""),
      Self::Full { name, description } => OptionDecl::new(&name, &description),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyDoc {
  Target(Target),
  Full {
    target: Target,
    #[serde(default)]
    kind: DepKind,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    when: Option<Predicate>,
  },
}

impl DependencyDoc {
  fn into_spec(self) -> DependencySpec {
    match self {
      Self::Target(target) => DependencySpec::new(target, DepKind::Required),
      Self::Full {
        target,
        kind,
        options,
        when,
      } => DependencySpec {
        target,
        kind,
        options,
        when,
      },
    }
  }
}

#[derive(Debug, Deserialize)]
struct ResourceDoc {
  name: String,
  #[serde(flatten)]
  location: LocationDoc,
  #[serde(default)]
  destination: Option<String>,
}

impl ResourceDoc {
  fn into_resource(self) -> Result<Resource, String> {
    let what = format!("resource '{}'", self.name);
    Ok(Resource {
      source: self.location.into_source(&what)?,
      name: self.name,
      destination: self.destination,
    })
  }
}

fn default_strip() -> usize {
  1
}

#[derive(Debug, Deserialize)]
struct PatchDoc {
  #[serde(default)]
  url: Option<String>,
  #[serde(default)]
  sha256: Option<String>,
  #[serde(default)]
  sha1: Option<String>,
  #[serde(default)]
  inline: Option<String>,
  #[serde(default = "default_strip")]
  strip: usize,
  #[serde(default)]
  when: Option<Predicate>,
}

impl PatchDoc {
  fn into_spec(self) -> Result<PatchSpec, String> {
    let source = match (self.url, self.inline) {
      (Some(url), None) => {
        let checksum = match (self.sha256, self.sha1) {
          (Some(hex), _) => Some(Checksum::sha256(&hex).map_err(|e| format!("patch {}: {}", url, e))?),
          (None, Some(hex)) => Some(Checksum::sha1(&hex).map_err(|e| format!("patch {}: {}", url, e))?),
          (None, None) => None,
        };
        PatchSource::Url { url, checksum }
      }
      (None, Some(diff)) => PatchSource::Inline(diff),
      (Some(_), Some(_)) => return Err("a patch declares both url and inline".to_string()),
      (None, None) => return Err("a patch needs either url or inline".to_string()),
    };
    Ok(PatchSpec {
      source,
      strip: self.strip,
      when: self.when,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KegOnlyDoc {
  Flag(bool),
  Reason(String),
  Full { reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConflictDoc {
  Name(String),
  Full(Conflict),
}

#[derive(Debug, Deserialize)]
struct FormulaDoc {
  #[serde(default)]
  name: Option<String>,
  #[serde(default)]
  homepage: String,
  #[serde(default)]
  version: Option<String>,
  #[serde(flatten)]
  location: LocationDoc,
  #[serde(default)]
  stable: Option<VariantDoc>,
  #[serde(default)]
  devel: Option<VariantDoc>,
  #[serde(default)]
  head: Option<VariantDoc>,
  #[serde(default)]
  options: Vec<OptionDoc>,
  #[serde(default)]
  dependencies: Vec<DependencyDoc>,
  #[serde(default)]
  resources: Vec<ResourceDoc>,
  #[serde(default)]
  patches: Vec<PatchDoc>,
  #[serde(default)]
  keg_only: Option<KegOnlyDoc>,
  #[serde(default)]
  conflicts_with: Vec<ConflictDoc>,
  #[serde(default)]
  fails_with: Vec<CompilerFailure>,
  #[serde(default)]
  bottle: Option<BottleSpec>,
  #[serde(default)]
  install: ScriptedProcedure,
  #[serde(default)]
  test: Option<ScriptedProcedure>,
}

impl FormulaDoc {
  fn into_formula(self, fallback_name: Option<&str>) -> Result<Formula, String> {
    let name = match (self.name, fallback_name) {
      (Some(name), Some(file)) if name != file => {
        return Err(format!("name '{}' does not match file name '{}'", name, file));
      }
      (Some(name), _) => name,
      (None, Some(file)) => file.to_string(),
      (None, None) => return Err("missing 'name'".to_string()),
    };

    let stable = match (self.location.is_empty(), self.stable) {
      (false, Some(_)) => return Err("both a top-level url and a stable block are declared".to_string()),
      (false, None) => Some(self.location.into_source("stable source")?),
      (true, Some(stable)) => Some(stable.into_source("stable source")?),
      (true, None) => None,
    };

    let keg_only = match self.keg_only {
      None | Some(KegOnlyDoc::Flag(false)) => None,
      Some(KegOnlyDoc::Flag(true)) => Some(KegOnly { reason: String::new() }),
      Some(KegOnlyDoc::Reason(reason)) | Some(KegOnlyDoc::Full { reason }) => Some(KegOnly { reason }),
    };

    let conflicts_with = self
      .conflicts_with
      .into_iter()
      .map(|c| match c {
        ConflictDoc::Name(name) => Conflict { name, because: None },
        ConflictDoc::Full(conflict) => conflict,
      })
      .collect();

    let test = self
      .test
      .map(|t| Arc::new(t) as Arc<dyn crate::sandbox::TestProcedure>);

    Ok(Formula {
      name,
      homepage: self.homepage,
      version: self.version,
      sources: SourceSet {
        stable,
        devel: self.devel.map(|d| d.into_source("devel source")).transpose()?,
        head: self.head.map(|h| h.into_source("head source")).transpose()?,
      },
      options: self.options.into_iter().map(OptionDoc::into_decl).collect(),
      dependencies: self.dependencies.into_iter().map(DependencyDoc::into_spec).collect(),
      resources: self
        .resources
        .into_iter()
        .map(ResourceDoc::into_resource)
        .collect::<Result<_, _>>()?,
      patches: self
        .patches
        .into_iter()
        .map(PatchDoc::into_spec)
        .collect::<Result<_, _>>()?,
      keg_only,
      conflicts_with,
      fails_with: self.fails_with,
      bottle: self.bottle,
      install: Arc::new(self.install),
      test,
    })
  }
}

/// Parse a descriptor held in memory.
pub fn parse(text: &str) -> Result<Formula, FormulaError> {
  parse_named(text, None, Path::new("<memory>"))
}

fn parse_named(text: &str, file_name: Option<&str>, path: &Path) -> Result<Formula, FormulaError> {
  let descriptor_err = |message: String| FormulaError::Descriptor {
    path: path.to_path_buf(),
    message,
  };
  let doc: FormulaDoc = serde_json::from_str(text).map_err(|e| descriptor_err(e.to_string()))?;
  let formula = doc.into_formula(file_name).map_err(descriptor_err)?;
  formula.validate()?;
  Ok(formula)
}

/// Load `<name>.json`. A missing `name` is taken from the file stem.
pub fn load_file(path: &Path) -> Result<Formula, FormulaError> {
  let text = std::fs::read_to_string(path)?;
  let stem = path.file_stem().and_then(|s| s.to_str());
  parse_named(&text, stem, &PathBuf::from(path))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::{Requirement, Variant};
  use tempfile::TempDir;

  const SHA: &str = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

  const EXAMPLE: &str = r#"{
    "name": "example",
    "homepage": "https://example.com",
    "url": "https://example.com/example-1.2.3.tar.gz",
    "mirrors": ["https://mirror.example.com/example-1.2.3.tar.gz"],
    "sha256": "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
    "devel": {
      "url": "https://example.com/example-2.0-beta.tar.gz",
      "sha256": "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
      "dependencies": ["cairo"],
      "patches": [{"inline": "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n"}]
    },
    "head": {"url": "https://github.com/example/example.git", "branch": "main"},
    "options": [
      "universal",
      {"name": "with-qt", "description": "Build the Qt frontend"}
    ],
    "dependencies": [
      "pkg-config",
      {"target": "cmake", "kind": "build"},
      {"target": "qt", "kind": "optional"},
      {"target": "readline", "kind": "recommended"},
      {"target": "bar", "options": ["with-baz"], "when": {"with": "qt"}},
      {"target": "tool:xcode", "when": {"os": "darwin"}}
    ],
    "resources": [
      {"name": "additional_files", "url": "https://example.com/extra-0.1.tar.gz", "sha1": "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3"}
    ],
    "patches": [
      {"url": "https://example.com/fix.diff", "sha256": "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae", "strip": 0}
    ],
    "keg_only": "conflicts with the system copy",
    "conflicts_with": ["example-legacy", {"name": "other", "because": "both install bin/example"}],
    "fails_with": [{"compiler": "llvm-gcc", "build": 2336, "cause": "segfault"}],
    "install": [
      {"op": "system", "command": "./configure", "args": ["--prefix=$${prefix}"]},
      {"op": "system", "command": "make", "args": ["install"]}
    ],
    "test": [{"op": "system", "command": "$${bin}/example", "args": ["--version"]}]
  }"#;

  #[test]
  fn parses_full_descriptor() {
    let f = parse(EXAMPLE).unwrap();
    assert_eq!(f.name, "example");
    assert_eq!(f.version_for(Variant::Stable).as_deref(), Some("1.2.3"));
    assert_eq!(f.version_for(Variant::Devel).as_deref(), Some("2.0-beta"));

    let stable = f.source(Variant::Stable).unwrap();
    assert_eq!(stable.mirrors.len(), 1);
    assert_eq!(stable.checksum.as_ref().unwrap().hex, SHA);
    assert_eq!(stable.strategy, DownloadStrategy::Curl);

    let head = f.source(Variant::Head).unwrap();
    assert_eq!(head.strategy, DownloadStrategy::Git);
    assert_eq!(head.branch.as_deref(), Some("main"));

    assert_eq!(f.dependencies.len(), 6);
    assert_eq!(f.dependencies[1].kind, DepKind::Build);
    assert_eq!(f.dependencies[4].options, vec!["with-baz"]);
    assert!(f.dependencies[4].when.is_some());
    assert_eq!(
      f.dependencies[5].target,
      Target::Requirement(Requirement::Tool("xcode".to_string()))
    );
    assert_eq!(f.dependencies_for(Variant::Devel).len(), 7);
    assert_eq!(f.patches_for(Variant::Devel).len(), 2);
    assert_eq!(f.patches[0].strip, 0);

    assert!(f.resources[0].source.checksum.as_ref().unwrap().is_legacy());
    assert_eq!(f.keg_only.as_ref().unwrap().reason, "conflicts with the system copy");
    assert_eq!(f.conflicts_with.len(), 2);
    assert_eq!(f.fails_with[0].build, Some(2336));
    assert!(f.test.is_some());
  }

  #[test]
  fn variant_as_bare_url() {
    let f = parse(
      r#"{"name": "x", "url": "https://e.com/x-1.0.tar.gz", "head": "https://github.com/e/x.git", "install": []}"#,
    )
    .unwrap();
    assert_eq!(f.source(Variant::Head).unwrap().strategy, DownloadStrategy::Git);
  }

  #[test]
  fn keg_only_forms() {
    for (value, expected) in [("true", Some("")), ("false", None), (r#"{"reason": "r"}"#, Some("r"))] {
      let text = format!(r#"{{"name": "x", "url": "https://e.com/x-1.0.tar.gz", "keg_only": {}}}"#, value);
      let f = parse(&text).unwrap();
      assert_eq!(f.keg_only.map(|k| k.reason).as_deref(), expected);
    }
  }

  #[test]
  fn rejects_conflicting_locations() {
    let err = parse(
      r#"{"name": "x", "url": "https://e.com/x-1.0.tar.gz", "stable": "https://e.com/x-1.1.tar.gz"}"#,
    )
    .unwrap_err();
    assert!(matches!(err, FormulaError::Descriptor { .. }));

    let err = parse(r#"{"name": "x", "url": "https://e.com/x-1.0.tar.gz", "sha256": "abc"}"#).unwrap_err();
    assert!(err.to_string().contains("stable source"));
  }

  #[test]
  fn validation_runs_on_load() {
    let err = parse(
      r#"{"name": "x", "url": "https://e.com/x-1.0.tar.gz",
          "options": [{"name": "without-qt", "description": "d"}],
          "dependencies": [{"target": "qt", "kind": "optional"}]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, FormulaError::OptionCollision { .. }));
  }

  #[test]
  fn file_name_supplies_missing_name() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("zlib.json");
    std::fs::write(&path, r#"{"url": "https://zlib.net/zlib-1.3.tar.gz"}"#).unwrap();
    assert_eq!(load_file(&path).unwrap().name, "zlib");

    std::fs::write(&path, r#"{"name": "libz", "url": "https://zlib.net/zlib-1.3.tar.gz"}"#).unwrap();
    assert!(matches!(load_file(&path), Err(FormulaError::Descriptor { .. })));
  }
}
