use anyhow::Result;
use cellar_lib::formula::Variant;
use cellar_lib::platform::platform_triple;
use cellar_lib::prefix_lock::{LockMode, PrefixLock};
use cellar_lib::registry::Registry;
use serde_json::json;

use super::Context;
use crate::output::{print_info, print_json, print_stat, symbols, truncate_hash};

pub fn cmd_info(ctx: &Context, name: Option<&str>) -> Result<()> {
  match name {
    Some(name) => formula_info(ctx, name),
    None => host_info(ctx),
  }
}

fn host_info(ctx: &Context) -> Result<()> {
  let config = ctx.config();
  let triple = platform_triple();
  if ctx.output.is_json() {
    return print_json(&json!({
      "platform": triple,
      "prefix": config.prefix,
      "cache": config.cache,
      "parallelism": config.parallelism,
    }));
  }

  println!("System:");
  match triple {
    Some(triple) => print_stat("Platform", &triple),
    None => print_stat("Platform", "unsupported"),
  }
  print_stat("Prefix", &config.prefix.display().to_string());
  print_stat("Cache", &config.cache.display().to_string());
  print_stat("Jobs", &config.parallelism.to_string());
  Ok(())
}

fn formula_info(ctx: &Context, name: &str) -> Result<()> {
  let formulas = ctx.load_formulas()?;
  let Some(formula) = formulas.get(name) else {
    anyhow::bail!("no formula named '{}' in {}", name, ctx.formulas.display());
  };

  let config = ctx.config();
  let installed = if config.prefix.exists() {
    let _lock = PrefixLock::acquire(&config.prefix, LockMode::Shared, "cellar info")?;
    Registry::open(&config.prefix)?.records(name)
  } else {
    Vec::new()
  };

  if ctx.output.is_json() {
    let options: Vec<_> = formula
      .options
      .iter()
      .map(|o| json!({ "name": o.name, "description": o.description, "default": o.default }))
      .collect();
    let dependencies: Vec<_> = formula
      .dependencies
      .iter()
      .map(|d| json!({ "target": d.target.to_string(), "kind": d.kind.as_str() }))
      .collect();
    return print_json(&json!({
      "name": formula.name,
      "homepage": formula.homepage,
      "version": formula.version_for(Variant::Stable),
      "variants": formula.sources.variants(),
      "options": options,
      "dependencies": dependencies,
      "keg_only": formula.keg_only,
      "installed": installed,
    }));
  }

  let version = formula.version_for(Variant::Stable).unwrap_or_else(|| "-".to_string());
  println!("{} {}", formula.name, version);
  if !formula.homepage.is_empty() {
    print_stat("Homepage", &formula.homepage);
  }
  let variants: Vec<String> = formula.sources.variants().iter().map(|v| v.to_string()).collect();
  print_stat("Variants", &variants.join(", "));
  if let Some(keg_only) = &formula.keg_only {
    print_stat("Keg-only", &keg_only.reason);
  }

  if !formula.options.is_empty() {
    println!();
    println!("Options:");
    for option in &formula.options {
      let default = if option.default { " (default)" } else { "" };
      println!("  --{}{}  {}", option.name, default, option.description);
    }
  }

  if !formula.dependencies.is_empty() {
    println!();
    println!("Dependencies:");
    for dep in &formula.dependencies {
      let conditional = if dep.when.is_some() { ", conditional" } else { "" };
      println!("  {} {} ({}{})", symbols::INFO, dep.target, dep.kind.as_str(), conditional);
    }
  }

  println!();
  if installed.is_empty() {
    print_info("Not installed");
  } else {
    println!("Installed:");
    for record in &installed {
      println!(
        "  {} {} {} {}",
        symbols::SUCCESS,
        record.version,
        truncate_hash(&record.fingerprint),
        record.root.display()
      );
    }
  }
  Ok(())
}
