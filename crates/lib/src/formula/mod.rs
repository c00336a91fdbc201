//! Formula descriptor model.
//!
//! A [`Formula`] is the in-memory form of one package description: identity,
//! per-variant sources, options, dependencies, resources, patches and the
//! install / self-test procedures. Formulas are built programmatically or
//! loaded from JSON descriptors (see [`descriptor`]) and must pass
//! [`Formula::validate`] before they are resolved.

pub mod descriptor;
pub mod predicate;
pub mod registry;
pub mod types;
pub mod version;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::sandbox::{InstallProcedure, ScriptedProcedure, TestProcedure};

pub use predicate::{Predicate, PredicateEnv};
pub use registry::FormulaRegistry;
pub use types::{
  BottleEntry, BottleSpec, CompilerFailure, Conflict, DepKind, DependencySpec, DownloadStrategy, KegOnly, OptionDecl,
  PatchSource, PatchSpec, Requirement, Resource, SourceSet, SourceSpec, Target, Variant, option_key,
};

/// Errors raised while loading or validating descriptors.
#[derive(Debug, Error)]
pub enum FormulaError {
  #[error("{formula}: option '{option}' is declared more than once")]
  DuplicateOption { formula: String, option: String },

  #[error("{formula}: option '{option}' collides with the option generated for dependency '{dependency}'")]
  OptionCollision {
    formula: String,
    option: String,
    dependency: String,
  },

  #[error("{formula}: dependencies '{first}' and '{second}' both generate option '{option}'")]
  GeneratedOptionCollision {
    formula: String,
    option: String,
    first: String,
    second: String,
  },

  #[error("{formula}: invalid option name '{option}'")]
  InvalidOptionName { formula: String, option: String },

  #[error("{formula}: {kind} dependency on '{target}' cannot generate an option")]
  UnoptionableRequirement {
    formula: String,
    kind: &'static str,
    target: String,
  },

  #[error("{formula}: no source declared")]
  NoSource { formula: String },

  #[error("{formula}: cannot detect a version for the {variant} source '{url}'")]
  UnversionedSource {
    formula: String,
    variant: Variant,
    url: String,
  },

  #[error("formula '{0}' is defined more than once")]
  DuplicateFormula(String),

  #[error("invalid descriptor {path}: {message}")]
  Descriptor { path: PathBuf, message: String },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// A declarative package description.
#[derive(Clone)]
pub struct Formula {
  pub name: String,
  pub homepage: String,
  /// Explicit stable version; detected from the stable source when absent.
  pub version: Option<String>,
  pub sources: SourceSet,
  pub options: Vec<OptionDecl>,
  /// Dependencies for every variant; variant blocks add their own.
  pub dependencies: Vec<DependencySpec>,
  pub resources: Vec<Resource>,
  pub patches: Vec<PatchSpec>,
  pub keg_only: Option<KegOnly>,
  pub conflicts_with: Vec<Conflict>,
  pub fails_with: Vec<CompilerFailure>,
  pub bottle: Option<BottleSpec>,
  pub install: Arc<dyn InstallProcedure>,
  pub test: Option<Arc<dyn TestProcedure>>,
}

impl fmt::Debug for Formula {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Formula")
      .field("name", &self.name)
      .field("version", &self.version)
      .field("variants", &self.sources.variants())
      .field("options", &self.options)
      .field("dependencies", &self.dependencies)
      .field("keg_only", &self.keg_only)
      .finish_non_exhaustive()
  }
}

impl Formula {
  /// A formula with a stable source and an empty install procedure.
  pub fn new(name: &str, stable: SourceSpec) -> Self {
    Self {
      name: name.to_string(),
      homepage: String::new(),
      version: None,
      sources: SourceSet {
        stable: Some(stable),
        ..Default::default()
      },
      options: Vec::new(),
      dependencies: Vec::new(),
      resources: Vec::new(),
      patches: Vec::new(),
      keg_only: None,
      conflicts_with: Vec::new(),
      fails_with: Vec::new(),
      bottle: None,
      install: Arc::new(ScriptedProcedure::default()),
      test: None,
    }
  }

  pub fn with_version(mut self, version: &str) -> Self {
    self.version = Some(version.to_string());
    self
  }

  pub fn with_devel(mut self, devel: SourceSpec) -> Self {
    self.sources.devel = Some(devel);
    self
  }

  pub fn with_head(mut self, head: SourceSpec) -> Self {
    self.sources.head = Some(head);
    self
  }

  pub fn with_option(mut self, name: &str, description: &str) -> Self {
    self.options.push(OptionDecl::new(name, description));
    self
  }

  pub fn depends_on(mut self, dep: DependencySpec) -> Self {
    self.dependencies.push(dep);
    self
  }

  pub fn with_resource(mut self, resource: Resource) -> Self {
    self.resources.push(resource);
    self
  }

  pub fn with_patch(mut self, patch: PatchSpec) -> Self {
    self.patches.push(patch);
    self
  }

  pub fn keg_only(mut self, reason: &str) -> Self {
    self.keg_only = Some(KegOnly {
      reason: reason.to_string(),
    });
    self
  }

  pub fn conflicts_with(mut self, name: &str, because: Option<&str>) -> Self {
    self.conflicts_with.push(Conflict {
      name: name.to_string(),
      because: because.map(str::to_string),
    });
    self
  }

  pub fn fails_with(mut self, failure: CompilerFailure) -> Self {
    self.fails_with.push(failure);
    self
  }

  pub fn with_install(mut self, procedure: Arc<dyn InstallProcedure>) -> Self {
    self.install = procedure;
    self
  }

  pub fn with_test(mut self, procedure: Arc<dyn TestProcedure>) -> Self {
    self.test = Some(procedure);
    self
  }

  pub fn is_keg_only(&self) -> bool {
    self.keg_only.is_some()
  }

  pub fn source(&self, variant: Variant) -> Option<&SourceSpec> {
    self.sources.get(variant)
  }

  /// Version built for a variant. `head` is always `HEAD`.
  pub fn version_for(&self, variant: Variant) -> Option<String> {
    let source = self.sources.get(variant)?;
    match variant {
      Variant::Head => Some("HEAD".to_string()),
      Variant::Stable => self
        .version
        .clone()
        .or_else(|| source.version.clone())
        .or_else(|| detect_version(source)),
      Variant::Devel => source.version.clone().or_else(|| detect_version(source)),
    }
  }

  /// Top-level dependencies followed by the variant's own.
  pub fn dependencies_for(&self, variant: Variant) -> Vec<&DependencySpec> {
    let variant_deps = self.sources.get(variant).map(|s| s.dependencies.as_slice()).unwrap_or(&[]);
    self.dependencies.iter().chain(variant_deps).collect()
  }

  pub fn resources_for(&self, variant: Variant) -> Vec<&Resource> {
    let variant_res = self.sources.get(variant).map(|s| s.resources.as_slice()).unwrap_or(&[]);
    self.resources.iter().chain(variant_res).collect()
  }

  /// Patches in application order: top-level first, then variant-specific.
  pub fn patches_for(&self, variant: Variant) -> Vec<&PatchSpec> {
    let variant_patches = self.sources.get(variant).map(|s| s.patches.as_slice()).unwrap_or(&[]);
    self.patches.iter().chain(variant_patches).collect()
  }

  /// Every dependency across all variants, top-level first.
  fn all_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
    let variants = [&self.sources.stable, &self.sources.devel, &self.sources.head];
    self
      .dependencies
      .iter()
      .chain(variants.into_iter().flatten().flat_map(|s| s.dependencies.iter()))
  }

  /// Declared and dependency-generated options, keyed by option key.
  ///
  /// Explicit declarations come first. A recommended dependency turns its
  /// option on by default, including an explicit declaration overriding it.
  pub fn effective_options(&self) -> Vec<OptionDecl> {
    let mut out: Vec<OptionDecl> = self.options.clone();

    for dep in self.all_dependencies() {
      let Some(generated) = dep.generated_option() else {
        continue;
      };
      let key = option_key(&generated);
      let default = dep.kind == DepKind::Recommended;

      if let Some(existing) = out.iter_mut().find(|o| o.key() == key) {
        existing.default = existing.default || default;
        continue;
      }
      out.push(OptionDecl {
        description: match dep.kind {
          DepKind::Recommended => format!("Build without {} support", dep.target),
          _ => format!("Build with {} support", dep.target),
        },
        name: generated,
        default,
      });
    }

    out
  }

  /// Pre-resolution checks on option naming and sources.
  pub fn validate(&self) -> Result<(), FormulaError> {
    let mut explicit: HashMap<&str, &OptionDecl> = HashMap::new();
    for decl in &self.options {
      let name = decl.name.as_str();
      if name.is_empty() || name.starts_with("--") || name.chars().any(char::is_whitespace) {
        return Err(FormulaError::InvalidOptionName {
          formula: self.name.clone(),
          option: decl.name.clone(),
        });
      }
      if explicit.insert(decl.key(), decl).is_some() {
        return Err(FormulaError::DuplicateOption {
          formula: self.name.clone(),
          option: decl.name.clone(),
        });
      }
    }

    // key -> (generated name, target, kind) of the first dependency generating it
    let mut generated: BTreeMap<String, (String, &Target, DepKind)> = BTreeMap::new();
    for dep in self.all_dependencies() {
      if !dep.kind.is_optionable() {
        continue;
      }
      let Some(name) = dep.generated_option() else {
        return Err(FormulaError::UnoptionableRequirement {
          formula: self.name.clone(),
          kind: dep.kind.as_str(),
          target: dep.target.to_string(),
        });
      };
      let key = option_key(&name).to_string();

      if let Some((_, target, kind)) = generated.get(&key) {
        if *target != &dep.target || *kind != dep.kind {
          return Err(FormulaError::GeneratedOptionCollision {
            formula: self.name.clone(),
            option: key,
            first: target.to_string(),
            second: dep.target.to_string(),
          });
        }
        continue;
      }

      if let Some(decl) = explicit.get(key.as_str()) {
        let overrides_text = decl.name == name && !decl.description.trim().is_empty();
        if !overrides_text {
          return Err(FormulaError::OptionCollision {
            formula: self.name.clone(),
            option: decl.name.clone(),
            dependency: dep.target.to_string(),
          });
        }
      }

      generated.insert(key, (name, &dep.target, dep.kind));
    }

    let variants = self.sources.variants();
    if variants.is_empty() {
      return Err(FormulaError::NoSource {
        formula: self.name.clone(),
      });
    }
    for variant in variants {
      if self.version_for(variant).is_none() {
        return Err(FormulaError::UnversionedSource {
          formula: self.name.clone(),
          variant,
          url: self.sources.get(variant).map(|s| s.url.clone()).unwrap_or_default(),
        });
      }
    }

    Ok(())
  }
}

fn detect_version(source: &SourceSpec) -> Option<String> {
  source
    .tag
    .as_deref()
    .and_then(version::from_tag)
    .or_else(|| version::from_url(&source.url))
}
