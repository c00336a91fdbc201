//! The set of formulas dependency names are resolved against.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Formula, FormulaError, descriptor};

/// Formulas indexed by name.
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
  formulas: BTreeMap<String, Arc<Formula>>,
}

impl FormulaRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a formula. Names must be unique.
  pub fn insert(&mut self, formula: Formula) -> Result<(), FormulaError> {
    if self.formulas.contains_key(&formula.name) {
      return Err(FormulaError::DuplicateFormula(formula.name));
    }
    self.formulas.insert(formula.name.clone(), Arc::new(formula));
    Ok(())
  }

  pub fn with(mut self, formula: Formula) -> Result<Self, FormulaError> {
    self.insert(formula)?;
    Ok(self)
  }

  pub fn get(&self, name: &str) -> Option<Arc<Formula>> {
    self.formulas.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.formulas.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.formulas.keys().map(|k| k.as_str())
  }

  pub fn len(&self) -> usize {
    self.formulas.len()
  }

  pub fn is_empty(&self) -> bool {
    self.formulas.is_empty()
  }

  /// Load every `*.json` descriptor in `dir`, in file-name order.
  pub fn load_dir(dir: &Path) -> Result<Self, FormulaError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
      .collect();
    paths.sort();

    let mut registry = Self::new();
    for path in paths {
      debug!(path = %path.display(), "loading formula descriptor");
      registry.insert(descriptor::load_file(&path)?)?;
    }

    info!(dir = %dir.display(), count = registry.len(), "loaded formulas");
    Ok(registry)
  }
}
