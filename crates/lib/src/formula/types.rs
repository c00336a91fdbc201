//! Descriptor model types: sources, options, dependencies, resources, patches.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::{Arch, Os, Platform};
use crate::util::hash::Checksum;

use super::predicate::Predicate;

/// One of the mutually exclusive source configurations of a formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
  #[default]
  Stable,
  Devel,
  Head,
}

impl Variant {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Stable => "stable",
      Self::Devel => "devel",
      Self::Head => "head",
    }
  }

  /// The user flag selecting this variant, if any.
  pub fn flag(&self) -> Option<&'static str> {
    match self {
      Self::Stable => None,
      Self::Devel => Some("devel"),
      Self::Head => Some("HEAD"),
    }
  }
}

impl fmt::Display for Variant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// How a source is retrieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
  /// HTTP(S) or `file://` GET, extracted when the archive type is known.
  #[default]
  Curl,
  /// HTTP POST with optional form data.
  Post,
  /// Download only; never extract.
  Nounzip,
  /// Version-control checkout.
  Git,
}

impl DownloadStrategy {
  /// Pick a strategy for a source that did not declare `using`.
  pub fn detect(url: &str, has_vcs_ref: bool) -> Self {
    if has_vcs_ref || url.ends_with(".git") || url.starts_with("git://") || url.starts_with("git+") {
      Self::Git
    } else {
      Self::Curl
    }
  }
}

/// A retrievable source for one variant.
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
  pub url: String,
  /// Tried in order when the primary URL fails at the transport level.
  pub mirrors: Vec<String>,
  pub checksum: Option<Checksum>,
  pub strategy: DownloadStrategy,
  /// Form fields sent by the `post` strategy.
  pub post_data: BTreeMap<String, String>,
  pub tag: Option<String>,
  pub branch: Option<String>,
  /// For git sources, the commit the checkout must resolve to.
  pub revision: Option<String>,
  /// Explicit version for this variant; detected from the URL otherwise.
  pub version: Option<String>,
  pub dependencies: Vec<DependencySpec>,
  pub resources: Vec<Resource>,
  pub patches: Vec<PatchSpec>,
}

impl SourceSpec {
  pub fn new(url: impl Into<String>) -> Self {
    let url = url.into();
    Self {
      strategy: DownloadStrategy::detect(&url, false),
      url,
      ..Default::default()
    }
  }

  pub fn with_checksum(mut self, checksum: Checksum) -> Self {
    self.checksum = Some(checksum);
    self
  }

  pub fn with_mirror(mut self, mirror: impl Into<String>) -> Self {
    self.mirrors.push(mirror.into());
    self
  }

  pub fn with_strategy(mut self, strategy: DownloadStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
    self.dependencies.push(dep);
    self
  }

  pub fn with_patch(mut self, patch: PatchSpec) -> Self {
    self.patches.push(patch);
    self
  }

  /// Every URL to try, primary first.
  pub fn urls(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(|m| m.as_str()))
  }
}

/// The per-variant source blocks of a formula.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
  pub stable: Option<SourceSpec>,
  pub devel: Option<SourceSpec>,
  pub head: Option<SourceSpec>,
}

impl SourceSet {
  pub fn get(&self, variant: Variant) -> Option<&SourceSpec> {
    match variant {
      Variant::Stable => self.stable.as_ref(),
      Variant::Devel => self.devel.as_ref(),
      Variant::Head => self.head.as_ref(),
    }
  }

  pub fn has(&self, variant: Variant) -> bool {
    self.get(variant).is_some()
  }

  /// Declared variants in stable, devel, head order.
  pub fn variants(&self) -> Vec<Variant> {
    [Variant::Stable, Variant::Devel, Variant::Head]
      .into_iter()
      .filter(|v| self.has(*v))
      .collect()
  }
}

/// An explicitly declared build option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDecl {
  /// Declared name: `with-docs`, `without-check`, `universal`, or a bare key.
  pub name: String,
  #[serde(default)]
  pub description: String,
  /// Enabled when the user passes no flag for it.
  #[serde(default)]
  pub default: bool,
}

impl OptionDecl {
  pub fn new(name: &str, description: &str) -> Self {
    Self {
      name: name.to_string(),
      description: description.to_string(),
      default: name.starts_with("without-"),
    }
  }

  /// The internal option key (`with-foo` and `without-foo` both map to `foo`).
  pub fn key(&self) -> &str {
    option_key(&self.name)
  }
}

/// Strip a `with-` / `without-` prefix from a flag or option name.
pub fn option_key(name: &str) -> &str {
  name
    .strip_prefix("without-")
    .or_else(|| name.strip_prefix("with-"))
    .unwrap_or(name)
}

/// What a dependency edge contributes to a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
  #[default]
  Required,
  /// Needed only while building; excluded from the runtime closure.
  Build,
  /// On unless `without-<name>` is passed.
  Recommended,
  /// Off unless `with-<name>` is passed.
  Optional,
}

impl DepKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Required => "required",
      Self::Build => "build",
      Self::Recommended => "recommended",
      Self::Optional => "optional",
    }
  }

  /// Whether this kind generates a user-facing option.
  pub fn is_optionable(&self) -> bool {
    matches!(self, Self::Recommended | Self::Optional)
  }
}

/// A platform or tooling capability a formula needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Requirement {
  Tool(String),
  Os(Os),
  Arch(Arch),
}

impl fmt::Display for Requirement {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Tool(t) => write!(f, "tool:{}", t),
      Self::Os(os) => write!(f, "os:{}", os),
      Self::Arch(arch) => write!(f, "arch:{}", arch),
    }
  }
}

/// The target of a dependency declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
  Formula(String),
  Requirement(Requirement),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetParseError {
  #[error("empty dependency target")]
  Empty,

  #[error("unknown {kind} '{value}' in dependency target")]
  UnknownValue { kind: &'static str, value: String },
}

impl FromStr for Target {
  type Err = TargetParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.is_empty() {
      return Err(TargetParseError::Empty);
    }
    match s.split_once(':') {
      Some(("tool", tool)) if !tool.is_empty() => Ok(Self::Requirement(Requirement::Tool(tool.to_string()))),
      Some(("os", os)) => Os::parse(os).map(|os| Self::Requirement(Requirement::Os(os))).ok_or_else(|| {
        TargetParseError::UnknownValue {
          kind: "os",
          value: os.to_string(),
        }
      }),
      Some(("arch", arch)) => Arch::parse(arch)
        .map(|arch| Self::Requirement(Requirement::Arch(arch)))
        .ok_or_else(|| TargetParseError::UnknownValue {
          kind: "arch",
          value: arch.to_string(),
        }),
      _ => Ok(Self::Formula(s.to_string())),
    }
  }
}

impl TryFrom<String> for Target {
  type Error = TargetParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Target> for String {
  fn from(value: Target) -> Self {
    value.to_string()
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Formula(name) => write!(f, "{}", name),
      Self::Requirement(req) => write!(f, "{}", req),
    }
  }
}

impl Target {
  pub fn formula(name: &str) -> Self {
    Self::Formula(name.to_string())
  }

  /// Key of the option generated for an optional/recommended dependency on this target.
  pub fn option_key(&self) -> Option<&str> {
    match self {
      Self::Formula(name) => Some(name),
      Self::Requirement(Requirement::Tool(tool)) => Some(tool),
      Self::Requirement(_) => None,
    }
  }
}

/// A dependency declaration.
#[derive(Debug, Clone)]
pub struct DependencySpec {
  pub target: Target,
  pub kind: DepKind,
  /// Options the target must be built with.
  pub options: Vec<String>,
  /// Activation condition; absent means always.
  pub when: Option<Predicate>,
}

impl DependencySpec {
  pub fn new(target: Target, kind: DepKind) -> Self {
    Self {
      target,
      kind,
      options: Vec::new(),
      when: None,
    }
  }

  pub fn required(name: &str) -> Self {
    Self::new(Target::formula(name), DepKind::Required)
  }

  pub fn build(name: &str) -> Self {
    Self::new(Target::formula(name), DepKind::Build)
  }

  pub fn optional(name: &str) -> Self {
    Self::new(Target::formula(name), DepKind::Optional)
  }

  pub fn recommended(name: &str) -> Self {
    Self::new(Target::formula(name), DepKind::Recommended)
  }

  pub fn with_options(mut self, options: &[&str]) -> Self {
    self.options = options.iter().map(|o| o.to_string()).collect();
    self
  }

  pub fn when(mut self, predicate: Predicate) -> Self {
    self.when = Some(predicate);
    self
  }

  /// Name of the option auto-generated for this dependency, if any.
  pub fn generated_option(&self) -> Option<String> {
    let key = self.target.option_key()?;
    match self.kind {
      DepKind::Optional => Some(format!("with-{}", key)),
      DepKind::Recommended => Some(format!("without-{}", key)),
      DepKind::Required | DepKind::Build => None,
    }
  }
}

/// An auxiliary download staged on demand by the install procedure.
#[derive(Debug, Clone, Default)]
pub struct Resource {
  pub name: String,
  pub source: SourceSpec,
  /// Staging directory relative to the build workspace; defaults to the resource name.
  pub destination: Option<String>,
}

/// Where a patch's diff text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchSource {
  Url { url: String, checksum: Option<Checksum> },
  Inline(String),
}

/// A patch applied to the source tree before building.
#[derive(Debug, Clone)]
pub struct PatchSpec {
  pub source: PatchSource,
  /// Leading path components removed from diff paths (`-pN`).
  pub strip: usize,
  pub when: Option<Predicate>,
}

impl PatchSpec {
  pub fn inline(diff: impl Into<String>) -> Self {
    Self {
      source: PatchSource::Inline(diff.into()),
      strip: 1,
      when: None,
    }
  }

  pub fn url(url: impl Into<String>, checksum: Option<Checksum>) -> Self {
    Self {
      source: PatchSource::Url {
        url: url.into(),
        checksum,
      },
      strip: 1,
      when: None,
    }
  }

  pub fn with_strip(mut self, strip: usize) -> Self {
    self.strip = strip;
    self
  }

  /// Human-readable origin for diagnostics.
  pub fn origin(&self) -> String {
    match &self.source {
      PatchSource::Url { url, .. } => url.clone(),
      PatchSource::Inline(_) => "inline".to_string(),
    }
  }
}

/// Installed but never linked into the shared prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KegOnly {
  pub reason: String,
}

/// Another formula that cannot be installed alongside this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
  pub name: String,
  #[serde(default)]
  pub because: Option<String>,
}

/// A compiler known not to build this formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerFailure {
  pub compiler: String,
  /// Builds up to and including this one fail; absent means every build.
  #[serde(default)]
  pub build: Option<u32>,
  #[serde(default)]
  pub cause: Option<String>,
}

impl CompilerFailure {
  pub fn matches(&self, compiler: &crate::platform::Compiler) -> bool {
    if self.compiler != compiler.name {
      return false;
    }
    match (self.build, compiler.build) {
      (None, _) => true,
      (Some(_), None) => true,
      (Some(limit), Some(build)) => build <= limit,
    }
  }
}

/// A prebuilt payload for a specific platform and the default option set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleEntry {
  pub platform: Platform,
  pub url: String,
  pub checksum: Checksum,
}

/// Prebuilt payloads declared by the formula.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleSpec {
  /// Bumped to invalidate older payloads of the same version.
  #[serde(default)]
  pub revision: u32,
  #[serde(default)]
  pub entries: Vec<BottleEntry>,
}
