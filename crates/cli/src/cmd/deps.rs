//! Implementation of the `cellar deps` command.

use anyhow::Result;
use cellar_lib::DependencyGraph;
use serde_json::json;

use super::{Context, detect_facts, normalize_flags};
use crate::output::{print_json, print_stat, symbols, truncate_hash};

/// Print the install waves of `name` under `flags`.
pub fn cmd_deps(ctx: &Context, name: &str, flags: &[String]) -> Result<()> {
  let formulas = ctx.load_formulas()?;
  let facts = detect_facts()?;
  let graph = DependencyGraph::resolve(name, &normalize_flags(flags), &formulas, &facts)?;

  if ctx.output.is_json() {
    let nodes: Vec<_> = graph
      .build_order()
      .into_iter()
      .map(|node| {
        let deps: Vec<_> = graph
          .dependencies(node.name())
          .into_iter()
          .map(|(dep, kind)| json!({ "name": dep, "kind": kind.as_str() }))
          .collect();
        json!({
          "name": node.name(),
          "options": node.options,
          "fingerprint": node.options.fingerprint(),
          "dependencies": deps,
        })
      })
      .collect();
    return print_json(&json!({ "root": name, "nodes": nodes }));
  }

  for (idx, wave) in graph.waves().into_iter().enumerate() {
    println!("Wave {}:", idx + 1);
    for node in wave {
      let flags = node.options.as_flags();
      let flags = if flags.is_empty() {
        String::new()
      } else {
        format!(" [{}]", flags.join(", "))
      };
      println!(
        "  {} {} {}{}",
        symbols::INFO,
        node.name(),
        truncate_hash(&node.options.fingerprint()),
        flags
      );
      for (dep, kind) in graph.dependencies(node.name()) {
        println!("      {} {} ({})", symbols::ARROW, dep, kind.as_str());
      }
    }
  }
  println!();
  print_stat("Formulas", &graph.len().to_string());
  Ok(())
}
