//! Implementation of the `cellar list` command.

use anyhow::Result;
use cellar_lib::InstallationRecord;
use cellar_lib::layout::Layout;
use cellar_lib::prefix_lock::{LockMode, PrefixLock};
use cellar_lib::registry::Registry;

use super::Context;
use crate::output::{print_info, print_json, print_warning, symbols, truncate_hash};

/// List registered kegs, marking the active one of each formula.
///
/// With `verify`, every keg is re-hashed against its receipt and the command
/// fails if any was modified after promotion.
pub fn cmd_list(ctx: &Context, name: Option<&str>, verify: bool) -> Result<()> {
  let config = ctx.config();
  if !config.prefix.exists() {
    if ctx.output.is_json() {
      return print_json(&Vec::<()>::new());
    }
    print_info("Nothing installed.");
    return Ok(());
  }

  let _lock = PrefixLock::acquire(&config.prefix, LockMode::Shared, "cellar list")?;
  let registry = Registry::open(&config.prefix)?;
  let mut records = match name {
    Some(name) => registry.records(name),
    None => registry.installed(),
  };
  records.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));

  let layout = Layout::new(config.prefix.clone());
  let mut modified = Vec::new();
  if verify {
    for record in &records {
      if !layout.verify(record)? {
        modified.push(record.key());
      }
    }
  }

  if ctx.output.is_json() {
    print_json(&records)?;
  } else {
    print_records(&registry, &records);
  }

  if !modified.is_empty() {
    for key in &modified {
      print_warning(&format!("keg {} was modified after install", key));
    }
    anyhow::bail!("{} keg(s) failed verification", modified.len());
  }
  Ok(())
}

fn print_records(registry: &Registry, records: &[InstallationRecord]) {
  if records.is_empty() {
    print_info("Nothing installed.");
    return;
  }
  for record in records {
    let active = registry.active(&record.name).is_some_and(|a| a.key() == record.key());
    let marker = if active { symbols::SUCCESS } else { " " };
    let deps = if record.runtime_dependencies.is_empty() {
      String::new()
    } else {
      format!(" {} {}", symbols::ARROW, record.runtime_dependencies.join(", "))
    };
    println!(
      "{} {} {} {}{}",
      marker,
      record.name,
      record.version,
      truncate_hash(&record.fingerprint),
      deps
    );
  }
}
