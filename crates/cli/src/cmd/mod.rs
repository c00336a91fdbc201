mod deps;
mod info;
mod install;
mod list;

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use cellar_lib::{Config, FormulaRegistry, PlatformFacts};

use crate::output::OutputFormat;

pub use deps::cmd_deps;
pub use info::cmd_info;
pub use install::{InstallArgs, cmd_install};
pub use list::cmd_list;
pub use test::cmd_test;

/// Global options shared by every command.
pub struct Context {
  pub formulas: PathBuf,
  pub prefix: Option<PathBuf>,
  pub output: OutputFormat,
}

impl Context {
  pub fn config(&self) -> Config {
    let config = Config::from_env();
    match &self.prefix {
      Some(prefix) => config.with_prefix(prefix),
      None => config,
    }
  }

  pub fn load_formulas(&self) -> Result<FormulaRegistry> {
    FormulaRegistry::load_dir(&self.formulas)
      .with_context(|| format!("Failed to load formulas from {}", self.formulas.display()))
  }
}

pub fn detect_facts() -> Result<PlatformFacts> {
  match PlatformFacts::detect() {
    Some(facts) => Ok(facts),
    None => bail!("unsupported platform"),
  }
}

/// Strip leading dashes so `--with-bar` and `with-bar` mean the same.
pub fn normalize_flags(flags: &[String]) -> Vec<String> {
  flags.iter().map(|f| f.trim_start_matches('-').to_string()).collect()
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_lose_leading_dashes() {
    let flags = vec!["--with-bar".to_string(), "HEAD".to_string(), "-universal".to_string()];
    assert_eq!(normalize_flags(&flags), vec!["with-bar", "HEAD", "universal"]);
  }
}
