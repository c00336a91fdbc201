//! Implementation of the `cellar install` command.

use std::time::Instant;

use anyhow::{Context as _, Result};
use cellar_lib::Installer;
use cellar_lib::install::InstallReport;
use serde_json::json;
use tracing::info;

use super::{Context, detect_facts, normalize_flags, runtime};
use crate::output::{
  format_duration, print_error, print_info, print_json, print_stat, print_success, print_warning, truncate_hash,
};

/// Per-invocation overrides of the session config.
pub struct InstallArgs {
  pub build_from_source: bool,
  pub run_tests: bool,
  pub jobs: Option<usize>,
}

/// Resolve `name` under `flags` and install the whole graph.
///
/// Exits non-zero when any node failed or was skipped; kegs that did install
/// stay installed.
pub fn cmd_install(ctx: &Context, name: &str, flags: &[String], args: InstallArgs) -> Result<()> {
  let mut config = ctx.config();
  config.build_from_source |= args.build_from_source;
  config.run_tests |= args.run_tests;
  if let Some(jobs) = args.jobs {
    config = config.with_parallelism(jobs);
  }

  let formulas = ctx.load_formulas()?;
  let facts = detect_facts()?;
  let flags = normalize_flags(flags);
  info!(formula = name, flags = ?flags, prefix = %config.prefix.display(), "install requested");

  let installer = Installer::open_for(config, facts, formulas, &format!("cellar install {}", name))
    .context("Failed to open install session")?;

  let started = Instant::now();
  let rt = runtime()?;
  let report = rt.block_on(installer.install(name, &flags))?;
  let elapsed = started.elapsed();

  if ctx.output.is_json() {
    print_json(&report_json(&report))?;
  } else {
    print_report(&report);
    println!();
    print_stat("Finished in", &format_duration(elapsed));
  }

  report.into_result()?;
  Ok(())
}

fn print_report(report: &InstallReport) {
  for installed in &report.installed {
    let record = &installed.record;
    print_success(&format!(
      "{} {} ({}, {})",
      record.name,
      record.version,
      truncate_hash(&record.fingerprint),
      installed.provenance
    ));
    print_stat("Keg", &record.root.display().to_string());
    if record.keg_only {
      print_info(&format!("{} is keg-only and was not linked into the prefix", record.name));
    }
  }
  for warning in &report.test_warnings {
    print_warning(&format!("self-test failed: {}", warning));
  }
  for skipped in &report.skipped {
    print_warning(&format!("{} skipped: dependency {} failed", skipped.name, skipped.dependency));
  }
  for (name, err) in &report.failed {
    print_error(&format!("{}: {}", name, err));
  }
}

fn report_json(report: &InstallReport) -> serde_json::Value {
  let installed: Vec<_> = report
    .installed
    .iter()
    .map(|i| json!({ "record": i.record, "provenance": i.provenance.to_string() }))
    .collect();
  let failed: Vec<_> = report
    .failed
    .iter()
    .map(|(name, err)| json!({ "name": name, "error": err.to_string() }))
    .collect();
  let skipped: Vec<_> = report
    .skipped
    .iter()
    .map(|s| json!({ "name": s.name, "dependency": s.dependency }))
    .collect();
  let warnings: Vec<_> = report.test_warnings.iter().map(|w| w.to_string()).collect();
  json!({ "installed": installed, "failed": failed, "skipped": skipped, "test_warnings": warnings })
}
