//! Activation predicates for dependencies and patches.
//!
//! Predicates are pure: they only see the option state and the captured
//! `PlatformFacts`, so evaluating one twice under the same state is stable.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::platform::{Arch, Os, PlatformFacts};

use super::types::Variant;

/// State a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct PredicateEnv<'a> {
  pub variant: Variant,
  /// Enabled option keys.
  pub enabled: &'a BTreeSet<String>,
  pub universal: bool,
  pub facts: &'a PlatformFacts,
}

pub type CustomPredicate = Arc<dyn Fn(&PredicateEnv<'_>) -> bool + Send + Sync>;

/// A condition over options, variant and platform.
///
/// In descriptors: `"always"`, `{"with": "bar"}`, `{"without": "check"}`,
/// `{"os": "darwin"}`, `{"arch": "x86_64"}`, `{"variant": "head"}`,
/// `{"all": [...]}`, `{"any": [...]}`, `{"not": {...}}`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
  Always,
  With(String),
  Without(String),
  Os(Os),
  Arch(Arch),
  Variant(Variant),
  All(Vec<Predicate>),
  Any(Vec<Predicate>),
  Not(Box<Predicate>),
  /// Programmatic condition; must not perform I/O.
  #[serde(skip)]
  Custom(CustomPredicate),
}

impl Predicate {
  pub fn with(option: &str) -> Self {
    Self::With(option.to_string())
  }

  pub fn without(option: &str) -> Self {
    Self::Without(option.to_string())
  }

  pub fn custom(f: impl Fn(&PredicateEnv<'_>) -> bool + Send + Sync + 'static) -> Self {
    Self::Custom(Arc::new(f))
  }

  pub fn evaluate(&self, env: &PredicateEnv<'_>) -> bool {
    match self {
      Self::Always => true,
      Self::With(opt) => is_enabled(env, opt),
      Self::Without(opt) => !is_enabled(env, opt),
      Self::Os(os) => env.facts.os() == *os,
      Self::Arch(arch) => env.facts.arch() == *arch,
      Self::Variant(variant) => env.variant == *variant,
      Self::All(preds) => preds.iter().all(|p| p.evaluate(env)),
      Self::Any(preds) => preds.iter().any(|p| p.evaluate(env)),
      Self::Not(pred) => !pred.evaluate(env),
      Self::Custom(f) => f(env),
    }
  }
}

fn is_enabled(env: &PredicateEnv<'_>, option: &str) -> bool {
  let key = super::types::option_key(option);
  if key == "universal" {
    return env.universal;
  }
  env.enabled.contains(key)
}

impl fmt::Debug for Predicate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Always => write!(f, "always"),
      Self::With(o) => write!(f, "with({})", o),
      Self::Without(o) => write!(f, "without({})", o),
      Self::Os(os) => write!(f, "os({})", os),
      Self::Arch(arch) => write!(f, "arch({})", arch),
      Self::Variant(v) => write!(f, "variant({})", v),
      Self::All(preds) => f.debug_tuple("all").field(preds).finish(),
      Self::Any(preds) => f.debug_tuple("any").field(preds).finish(),
      Self::Not(pred) => f.debug_tuple("not").field(pred).finish(),
      Self::Custom(_) => write!(f, "custom(..)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::Platform;

  fn facts() -> PlatformFacts {
    PlatformFacts::new(Platform::new(Arch::X86_64, Os::Linux))
  }

  #[test]
  fn option_predicates() {
    let facts = facts();
    let enabled: BTreeSet<String> = ["bar".to_string()].into_iter().collect();
    let env = PredicateEnv {
      variant: Variant::Stable,
      enabled: &enabled,
      universal: false,
      facts: &facts,
    };

    assert!(Predicate::with("bar").evaluate(&env));
    assert!(Predicate::with("with-bar").evaluate(&env));
    assert!(!Predicate::without("bar").evaluate(&env));
    assert!(Predicate::without("qt").evaluate(&env));
    assert!(!Predicate::with("universal").evaluate(&env));
  }

  #[test]
  fn combinators_and_platform() {
    let facts = facts();
    let enabled = BTreeSet::new();
    let env = PredicateEnv {
      variant: Variant::Head,
      enabled: &enabled,
      universal: false,
      facts: &facts,
    };

    let pred = Predicate::All(vec![
      Predicate::Os(Os::Linux),
      Predicate::Not(Box::new(Predicate::Arch(Arch::Aarch64))),
      Predicate::Any(vec![Predicate::Variant(Variant::Devel), Predicate::Variant(Variant::Head)]),
    ]);
    assert!(pred.evaluate(&env));
    assert!(!Predicate::Os(Os::MacOs).evaluate(&env));
  }

  #[test]
  fn deserializes_descriptor_syntax() {
    let pred: Predicate = serde_json::from_str(r#"{"all": [{"with": "bar"}, {"not": {"os": "darwin"}}]}"#).unwrap();
    assert!(matches!(pred, Predicate::All(ref v) if v.len() == 2));

    let always: Predicate = serde_json::from_str(r#""always""#).unwrap();
    assert!(matches!(always, Predicate::Always));
  }

  #[test]
  fn custom_predicates_see_facts() {
    let facts = facts().with_tool("xcode");
    let enabled = BTreeSet::new();
    let env = PredicateEnv {
      variant: Variant::Stable,
      enabled: &enabled,
      universal: false,
      facts: &facts,
    };
    let pred = Predicate::custom(|env| env.facts.tools.contains("xcode"));
    assert!(pred.evaluate(&env));
  }
}
