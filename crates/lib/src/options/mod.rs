//! Option and variant resolution.
//!
//! [`resolve`] turns user flags into the effective build configuration of a
//! single formula. Layers are applied in a fixed order: declared defaults,
//! dependency-derived defaults, explicit user flags, then `universal` and other
//! platform-driven adjustments. Dependency predicates are evaluated here,
//! exactly once per pass, and the active edges are handed to the graph builder.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::formula::{DepKind, Formula, FormulaError, PredicateEnv, Target, Variant, option_key};
use crate::platform::PlatformFacts;
use crate::util::hash::Hashable;

/// Errors raised while resolving options.
#[derive(Debug, Error)]
pub enum OptionsError {
  #[error("{formula}: conflicting options '{first}' and '{second}'")]
  Conflict {
    formula: String,
    first: String,
    second: String,
  },

  #[error("{formula}: unknown option '{option}'")]
  UnknownOption { formula: String, option: String },

  #[error("{formula}: no {variant} source is declared")]
  MissingVariant { formula: String, variant: Variant },

  #[error(transparent)]
  InvalidDescriptor(#[from] FormulaError),
}

/// A dependency edge that survived option and predicate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDependency {
  pub target: Target,
  pub kind: DepKind,
  /// Options the target must be built with.
  pub options: BTreeSet<String>,
}

/// The effective build configuration of one formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOptions {
  pub variant: Variant,
  /// Enabled option keys (`with-foo` contributes `foo`).
  pub enabled: BTreeSet<String>,
  pub universal: bool,
  /// Options required on each formula dependency, by target name.
  pub constraints: BTreeMap<String, BTreeSet<String>>,
  /// Active dependency edges in declaration order.
  pub dependencies: Vec<ActiveDependency>,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
  variant: Variant,
  enabled: &'a BTreeSet<String>,
  universal: bool,
}

impl Hashable for FingerprintInput<'_> {}

impl ResolvedOptions {
  /// Whether `name` (`foo` or `with-foo`) is enabled.
  pub fn with(&self, name: &str) -> bool {
    let key = option_key(name);
    if key == "universal" {
      return self.universal;
    }
    self.enabled.contains(key)
  }

  pub fn without(&self, name: &str) -> bool {
    !self.with(name)
  }

  /// Truncated SHA-256 identifying variant and enabled options.
  pub fn fingerprint(&self) -> String {
    let input = FingerprintInput {
      variant: self.variant,
      enabled: &self.enabled,
      universal: self.universal,
    };
    match input.compute_hash() {
      Ok(hash) => hash.0,
      // serializing sets of strings cannot fail
      Err(_) => String::new(),
    }
  }

  /// Flags that reproduce this option set when passed to [`resolve`].
  pub fn as_flags(&self) -> Vec<String> {
    let mut flags: Vec<String> = self.variant.flag().map(str::to_string).into_iter().collect();
    flags.extend(self.enabled.iter().map(|k| format!("with-{}", k)));
    if self.universal {
      flags.push("universal".to_string());
    }
    flags
  }
}

enum Flag<'a> {
  Variant(Variant, &'a str),
  Universal,
  Set(&'a str, bool),
}

fn classify(flag: &str) -> Flag<'_> {
  match flag {
    "HEAD" | "head" => Flag::Variant(Variant::Head, flag),
    "devel" => Flag::Variant(Variant::Devel, flag),
    "universal" => Flag::Universal,
    _ => {
      if let Some(key) = flag.strip_prefix("without-") {
        Flag::Set(key, false)
      } else if let Some(key) = flag.strip_prefix("with-") {
        Flag::Set(key, true)
      } else {
        Flag::Set(flag, true)
      }
    }
  }
}

/// Resolve the effective options of `formula` under `flags`.
pub fn resolve<S: AsRef<str>>(
  formula: &Formula,
  flags: &[S],
  facts: &PlatformFacts,
) -> Result<ResolvedOptions, OptionsError> {
  formula.validate()?;

  let declared = formula.effective_options();
  let known: BTreeSet<&str> = declared.iter().map(|o| o.key()).collect();

  // declared and dependency-derived defaults
  let mut enabled: BTreeSet<String> = declared
    .iter()
    .filter(|o| o.default && o.key() != "universal")
    .map(|o| o.key().to_string())
    .collect();

  let mut variant: Option<(Variant, &str)> = None;
  let mut universal = false;
  let mut seen: BTreeMap<&str, (bool, &str)> = BTreeMap::new();

  // explicit user flags
  for raw in flags {
    let flag = raw.as_ref().trim_start_matches("--");
    match classify(flag) {
      Flag::Variant(v, name) => {
        if let Some((prev, prev_name)) = variant
          && prev != v
        {
          return Err(OptionsError::Conflict {
            formula: formula.name.clone(),
            first: prev_name.to_string(),
            second: name.to_string(),
          });
        }
        variant = Some((v, name));
      }
      Flag::Universal => {
        if !known.contains("universal") {
          return Err(OptionsError::UnknownOption {
            formula: formula.name.clone(),
            option: flag.to_string(),
          });
        }
        universal = true;
      }
      Flag::Set("universal", on) if known.contains("universal") => universal = on,
      Flag::Set(key, on) => {
        if !known.contains(key) {
          return Err(OptionsError::UnknownOption {
            formula: formula.name.clone(),
            option: flag.to_string(),
          });
        }
        if let Some((prev_on, prev_flag)) = seen.get(key)
          && *prev_on != on
        {
          return Err(OptionsError::Conflict {
            formula: formula.name.clone(),
            first: prev_flag.to_string(),
            second: flag.to_string(),
          });
        }
        seen.insert(key, (on, flag));
        if on {
          enabled.insert(key.to_string());
        } else {
          enabled.remove(key);
        }
      }
    }
  }

  let variant = variant.map(|(v, _)| v).unwrap_or(Variant::Stable);
  if !formula.sources.has(variant) {
    return Err(OptionsError::MissingVariant {
      formula: formula.name.clone(),
      variant,
    });
  }

  // platform-driven adjustments
  if universal && !facts.os().supports_universal() {
    warn!(formula = %formula.name, os = %facts.os(), "universal builds are not supported on this platform, ignoring");
    universal = false;
  }

  let env = PredicateEnv {
    variant,
    enabled: &enabled,
    universal,
    facts,
  };

  let mut dependencies = Vec::new();
  let mut constraints: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
  for dep in formula.dependencies_for(variant) {
    let selected = match dep.kind {
      DepKind::Optional | DepKind::Recommended => dep.target.option_key().is_some_and(|k| enabled.contains(k)),
      DepKind::Required | DepKind::Build => true,
    };
    if !selected || !dep.when.as_ref().is_none_or(|p| p.evaluate(&env)) {
      debug!(formula = %formula.name, target = %dep.target, "dependency inactive");
      continue;
    }

    let options: BTreeSet<String> = dep.options.iter().cloned().collect();
    if let Target::Formula(name) = &dep.target
      && !options.is_empty()
    {
      constraints.entry(name.clone()).or_insert_with(|| options.clone());
    }
    dependencies.push(ActiveDependency {
      target: dep.target.clone(),
      kind: dep.kind,
      options,
    });
  }

  Ok(ResolvedOptions {
    variant,
    enabled,
    universal,
    constraints,
    dependencies,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::{DependencySpec, Predicate, SourceSpec};
  use crate::platform::{Arch, Os, Platform};

  fn linux() -> PlatformFacts {
    PlatformFacts::new(Platform::new(Arch::X86_64, Os::Linux))
  }

  fn mac() -> PlatformFacts {
    PlatformFacts::new(Platform::new(Arch::Aarch64, Os::MacOs))
  }

  fn libfoo() -> Formula {
    Formula::new("libfoo", SourceSpec::new("https://example.com/libfoo-1.0.tar.gz"))
      .with_head(SourceSpec::new("https://example.com/libfoo.git"))
      .with_option("with-bar", "Build with bar support")
      .with_option("universal", "Build a universal binary")
      .depends_on(DependencySpec::required("bar").when(Predicate::with("bar")))
      .depends_on(DependencySpec::recommended("readline"))
      .depends_on(DependencySpec::optional("glib"))
  }

  fn targets(resolved: &ResolvedOptions) -> Vec<String> {
    resolved.dependencies.iter().map(|d| d.target.to_string()).collect()
  }

  #[test]
  fn defaults_apply_without_flags() {
    let resolved = resolve::<&str>(&libfoo(), &[], &linux()).unwrap();
    assert_eq!(resolved.variant, Variant::Stable);
    assert!(resolved.with("readline"));
    assert!(resolved.without("bar"));
    assert!(resolved.without("glib"));
    assert_eq!(targets(&resolved), vec!["readline"]);
  }

  #[test]
  fn user_flags_override_defaults() {
    let resolved = resolve(&libfoo(), &["with-bar", "without-readline", "with-glib"], &linux()).unwrap();
    assert!(resolved.with("bar"));
    assert!(resolved.without("readline"));
    assert_eq!(targets(&resolved), vec!["bar", "glib"]);
  }

  #[test]
  fn contradictory_flags_conflict() {
    let err = resolve(&libfoo(), &["with-bar", "without-bar"], &linux()).unwrap_err();
    assert!(matches!(err, OptionsError::Conflict { ref first, ref second, .. } if first == "with-bar" && second == "without-bar"));

    let err = resolve(&libfoo(), &["HEAD", "devel"], &linux()).unwrap_err();
    assert!(matches!(err, OptionsError::Conflict { .. }));
  }

  #[test]
  fn unknown_flags_and_missing_variants() {
    assert!(matches!(
      resolve(&libfoo(), &["with-spam"], &linux()),
      Err(OptionsError::UnknownOption { .. })
    ));
    assert!(matches!(
      resolve(&libfoo(), &["devel"], &linux()),
      Err(OptionsError::MissingVariant {
        variant: Variant::Devel,
        ..
      })
    ));
    let head = resolve(&libfoo(), &["--HEAD"], &linux()).unwrap();
    assert_eq!(head.variant, Variant::Head);
  }

  #[test]
  fn universal_is_platform_driven() {
    let on_mac = resolve(&libfoo(), &["universal"], &mac()).unwrap();
    assert!(on_mac.universal);
    assert!(on_mac.with("universal"));

    let on_linux = resolve(&libfoo(), &["universal"], &linux()).unwrap();
    assert!(!on_linux.universal);
  }

  #[test]
  fn constraints_are_recorded_for_active_edges() {
    let f = libfoo().depends_on(DependencySpec::required("zeromq").with_options(&["with-pgm"]));
    let resolved = resolve::<&str>(&f, &[], &linux()).unwrap();
    let expected: BTreeSet<String> = ["with-pgm".to_string()].into_iter().collect();
    assert_eq!(resolved.constraints.get("zeromq"), Some(&expected));
  }

  #[test]
  fn resolution_is_deterministic() {
    let f = libfoo();
    let a = resolve(&f, &["with-glib", "with-bar"], &linux()).unwrap();
    let b = resolve(&f, &["with-bar", "with-glib"], &linux()).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.fingerprint(), b.fingerprint());

    let c = resolve(&f, &["with-bar"], &linux()).unwrap();
    assert_ne!(a.fingerprint(), c.fingerprint());
  }

  #[test]
  fn flags_round_trip_through_as_flags() {
    let f = libfoo();
    let a = resolve(&f, &["with-glib", "HEAD"], &linux()).unwrap();
    let b = resolve(&f, a.as_flags().as_slice(), &linux()).unwrap();
    assert_eq!(a, b);
  }
}
