//! Dependency graph construction and ordering.
//!
//! [`DependencyGraph::build`] expands the active dependencies of a resolved
//! formula recursively. Each formula appears once, with exactly one option
//! set; two edges asking for the same target with different options are an
//! error rather than being merged. Edges point from dependency to dependent
//! and carry the [`DepKind`] of the declaration.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;
use tracing::{debug, trace};

use crate::formula::{DepKind, Formula, FormulaRegistry, Requirement, Target, option_key};
use crate::options::{self, OptionsError, ResolvedOptions};
use crate::platform::PlatformFacts;

/// A dependency cycle, in traversal order, ending where it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(pub Vec<String>);

impl fmt::Display for CyclePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join(" -> "))
  }
}

/// Errors raised during graph resolution. None of them reach the executor.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error("dependency cycle: {path}")]
  Cycle { path: CyclePath },

  #[error("'{required_by}' depends on unknown formula '{name}'")]
  MissingDependency { name: String, required_by: String },

  #[error("'{target}' is required with options {first:?} by '{first_by}' but with {second:?} by '{second_by}'")]
  UnsatisfiableConstraint {
    target: String,
    first_by: String,
    first: BTreeSet<String>,
    second_by: String,
    second: BTreeSet<String>,
  },

  #[error("'{formula}' requires {requirement}, which this platform does not provide")]
  UnsatisfiedRequirement { formula: String, requirement: Requirement },

  #[error("'{first}' conflicts with '{second}'{}", .because.as_ref().map(|b| format!(": {}", b)).unwrap_or_default())]
  FormulaConflict {
    first: String,
    second: String,
    because: Option<String>,
  },

  #[error(transparent)]
  Options(#[from] OptionsError),
}

/// A formula with the option set it will be built with.
#[derive(Debug, Clone)]
pub struct GraphNode {
  pub formula: Arc<Formula>,
  pub options: ResolvedOptions,
}

impl GraphNode {
  pub fn name(&self) -> &str {
    &self.formula.name
  }
}

/// The resolved, acyclic dependency graph of one install request.
#[derive(Debug)]
pub struct DependencyGraph {
  /// Edges point from dependency to dependent.
  graph: DiGraph<GraphNode, DepKind>,
  nodes: HashMap<String, NodeIndex>,
  root: NodeIndex,
}

struct Builder<'a> {
  registry: &'a FormulaRegistry,
  facts: &'a PlatformFacts,
  graph: DiGraph<GraphNode, DepKind>,
  nodes: HashMap<String, NodeIndex>,
  /// target -> (first requester, options it asked for)
  requested: HashMap<String, (String, BTreeSet<String>)>,
  stack: Vec<String>,
}

/// Requested options as `(key, enabled)`, so `with-dbus`, `--with-dbus` and
/// `dbus` compare equal.
fn normalized(options: &BTreeSet<String>) -> BTreeSet<(&str, bool)> {
  options
    .iter()
    .map(|raw| {
      let flag = raw.trim_start_matches("--");
      (option_key(flag), !flag.starts_with("without-"))
    })
    .collect()
}

impl Builder<'_> {
  fn visit(&mut self, idx: NodeIndex) -> Result<(), GraphError> {
    let name = self.graph[idx].name().to_string();
    let deps = self.graph[idx].options.dependencies.clone();
    self.stack.push(name.clone());

    for dep in deps {
      let target = match &dep.target {
        Target::Requirement(req) => {
          self.check_requirement(&name, req)?;
          continue;
        }
        Target::Formula(target) => target,
      };

      if let Some(pos) = self.stack.iter().position(|n| n == target) {
        let mut path: Vec<String> = self.stack[pos..].to_vec();
        path.push(target.clone());
        return Err(GraphError::Cycle { path: CyclePath(path) });
      }

      match self.requested.get(target) {
        Some((first_by, first)) if normalized(first) != normalized(&dep.options) => {
          return Err(GraphError::UnsatisfiableConstraint {
            target: target.clone(),
            first_by: first_by.clone(),
            first: first.clone(),
            second_by: name.clone(),
            second: dep.options.clone(),
          });
        }
        Some(_) => {}
        None => {
          self.requested.insert(target.clone(), (name.clone(), dep.options.clone()));
        }
      }

      let dep_idx = match self.nodes.get(target) {
        Some(&existing) => existing,
        None => {
          let formula = self.registry.get(target).ok_or_else(|| GraphError::MissingDependency {
            name: target.clone(),
            required_by: name.clone(),
          })?;
          let flags: Vec<&str> = dep.options.iter().map(|s| s.as_str()).collect();
          let resolved = options::resolve(&formula, &flags, self.facts)?;
          trace!(formula = %target, fingerprint = %resolved.fingerprint(), "resolved dependency options");

          let new_idx = self.graph.add_node(GraphNode {
            formula,
            options: resolved,
          });
          self.nodes.insert(target.clone(), new_idx);
          self.visit(new_idx)?;
          new_idx
        }
      };

      debug!(from = %name, to = %target, kind = dep.kind.as_str(), "dependency edge");
      self.graph.add_edge(dep_idx, idx, dep.kind);
    }

    self.stack.pop();
    Ok(())
  }

  fn check_requirement(&self, formula: &str, req: &Requirement) -> Result<(), GraphError> {
    let satisfied = match req {
      Requirement::Tool(tool) => self.facts.has_tool(tool),
      Requirement::Os(os) => self.facts.os() == *os,
      Requirement::Arch(arch) => self.facts.arch() == *arch,
    };
    if satisfied {
      Ok(())
    } else {
      Err(GraphError::UnsatisfiedRequirement {
        formula: formula.to_string(),
        requirement: req.clone(),
      })
    }
  }
}

impl DependencyGraph {
  /// Expand the dependencies of `formula` resolved as `resolved`.
  pub fn build(
    formula: Arc<Formula>,
    resolved: ResolvedOptions,
    registry: &FormulaRegistry,
    facts: &PlatformFacts,
  ) -> Result<Self, GraphError> {
    let mut builder = Builder {
      registry,
      facts,
      graph: DiGraph::new(),
      nodes: HashMap::new(),
      requested: HashMap::new(),
      stack: Vec::new(),
    };

    let name = formula.name.clone();
    let root = builder.graph.add_node(GraphNode {
      formula,
      options: resolved,
    });
    builder.nodes.insert(name, root);
    builder.visit(root)?;

    let dag = Self {
      graph: builder.graph,
      nodes: builder.nodes,
      root,
    };
    dag.check_conflicts()?;
    Ok(dag)
  }

  /// Resolve `name` with `flags` and expand its graph.
  pub fn resolve<S: AsRef<str>>(
    name: &str,
    flags: &[S],
    registry: &FormulaRegistry,
    facts: &PlatformFacts,
  ) -> Result<Self, GraphError> {
    let formula = registry.get(name).ok_or_else(|| GraphError::MissingDependency {
      name: name.to_string(),
      required_by: "<request>".to_string(),
    })?;
    let resolved = options::resolve(&formula, flags, facts)?;
    Self::build(formula, resolved, registry, facts)
  }

  fn check_conflicts(&self) -> Result<(), GraphError> {
    for idx in self.graph.node_indices() {
      let node = &self.graph[idx];
      for conflict in &node.formula.conflicts_with {
        if self.nodes.contains_key(&conflict.name) {
          return Err(GraphError::FormulaConflict {
            first: node.name().to_string(),
            second: conflict.name.clone(),
            because: conflict.because.clone(),
          });
        }
      }
    }
    Ok(())
  }

  pub fn root(&self) -> &GraphNode {
    &self.graph[self.root]
  }

  pub fn node(&self, name: &str) -> Option<&GraphNode> {
    self.nodes.get(name).map(|&idx| &self.graph[idx])
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// Direct dependencies of `name` with their kinds, in declaration order.
  pub fn dependencies(&self, name: &str) -> Vec<(&str, DepKind)> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let mut deps: Vec<(NodeIndex, DepKind)> = self
      .graph
      .edges_directed(idx, Direction::Incoming)
      .map(|e| (e.source(), *e.weight()))
      .collect();
    deps.sort_by_key(|(i, _)| *i);
    deps.into_iter().map(|(i, kind)| (self.graph[i].name(), kind)).collect()
  }

  /// Stable topological order: dependencies first, ties by declaration order.
  pub fn build_order(&self) -> Vec<&GraphNode> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.dependency_indices(idx).len()))
      .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
      .iter()
      .filter(|&(_, &d)| d == 0)
      .map(|(&idx, _)| Reverse(idx))
      .collect();

    let mut order = Vec::with_capacity(self.graph.node_count());
    while let Some(Reverse(idx)) = ready.pop() {
      order.push(&self.graph[idx]);
      for dependent in self.dependent_indices(idx) {
        if let Some(deg) = in_degree.get_mut(&dependent) {
          *deg = deg.saturating_sub(1);
          if *deg == 0 {
            ready.push(Reverse(dependent));
          }
        }
      }
    }

    order
  }

  /// Groups of nodes whose dependencies all lie in earlier groups.
  pub fn waves(&self) -> Vec<Vec<&GraphNode>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.dependency_indices(idx).len()))
      .collect();
    let mut remaining: BTreeSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[*idx] == 0).copied().collect();
      if ready.is_empty() {
        // unreachable for graphs produced by `build`
        break;
      }

      for idx in &ready {
        remaining.remove(idx);
        for dependent in self.dependent_indices(*idx) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      waves.push(ready.into_iter().map(|idx| &self.graph[idx]).collect());
    }

    waves
  }

  /// Names `name` needs at runtime: every dependency reachable through
  /// non-build edges, in build order.
  pub fn runtime_closure(&self, name: &str) -> Vec<String> {
    let Some(&start) = self.nodes.get(name) else {
      return Vec::new();
    };

    let mut seen: HashSet<NodeIndex> = HashSet::new();
    let mut queue = vec![start];
    while let Some(idx) = queue.pop() {
      for edge in self.graph.edges_directed(idx, Direction::Incoming) {
        if *edge.weight() != DepKind::Build && seen.insert(edge.source()) {
          queue.push(edge.source());
        }
      }
    }

    self
      .build_order()
      .into_iter()
      .filter(|node| self.nodes.get(node.name()).is_some_and(|idx| seen.contains(idx)))
      .map(|node| node.name().to_string())
      .collect()
  }

  fn dependency_indices(&self, idx: NodeIndex) -> BTreeSet<NodeIndex> {
    self.graph.neighbors_directed(idx, Direction::Incoming).collect()
  }

  fn dependent_indices(&self, idx: NodeIndex) -> BTreeSet<NodeIndex> {
    self.graph.neighbors_directed(idx, Direction::Outgoing).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::{DependencySpec, Predicate, SourceSpec};
  use crate::platform::{Arch, Os, Platform};

  fn facts() -> PlatformFacts {
    PlatformFacts::new(Platform::new(Arch::X86_64, Os::Linux))
  }

  fn formula(name: &str) -> Formula {
    Formula::new(name, SourceSpec::new(format!("https://example.com/{}-1.0.tar.gz", name)))
  }

  fn names(nodes: &[&GraphNode]) -> Vec<String> {
    nodes.iter().map(|n| n.name().to_string()).collect()
  }

  fn libfoo_registry() -> FormulaRegistry {
    let libfoo = formula("libfoo")
      .with_option("with-bar", "Build with bar support")
      .depends_on(DependencySpec::required("bar").when(Predicate::with("bar")));
    FormulaRegistry::new().with(libfoo).unwrap().with(formula("bar")).unwrap()
  }

  #[test]
  fn libfoo_without_bar() {
    let graph = DependencyGraph::resolve::<&str>("libfoo", &[], &libfoo_registry(), &facts()).unwrap();
    assert!(!graph.contains("bar"));
    assert_eq!(names(&graph.build_order()), vec!["libfoo"]);
  }

  #[test]
  fn libfoo_with_bar() {
    let graph = DependencyGraph::resolve("libfoo", &["with-bar"], &libfoo_registry(), &facts()).unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(names(&graph.build_order()), vec!["bar", "libfoo"]);
  }

  fn diamond() -> FormulaRegistry {
    // app -> {net, ui}; net -> {ssl, zlib}; ui -> zlib; cmake is build-only
    FormulaRegistry::new()
      .with(
        formula("app")
          .depends_on(DependencySpec::required("net"))
          .depends_on(DependencySpec::required("ui"))
          .depends_on(DependencySpec::build("cmake")),
      )
      .unwrap()
      .with(
        formula("net")
          .depends_on(DependencySpec::required("ssl"))
          .depends_on(DependencySpec::required("zlib")),
      )
      .unwrap()
      .with(formula("ui").depends_on(DependencySpec::required("zlib")))
      .unwrap()
      .with(formula("ssl").depends_on(DependencySpec::build("perl")))
      .unwrap()
      .with(formula("zlib"))
      .unwrap()
      .with(formula("cmake"))
      .unwrap()
      .with(formula("perl"))
      .unwrap()
  }

  #[test]
  fn build_order_is_topological() {
    let registry = diamond();
    let graph = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap();
    let order = names(&graph.build_order());
    assert_eq!(order.len(), graph.len());

    let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
    for node in graph.build_order() {
      for (dep, _) in graph.dependencies(node.name()) {
        assert!(pos(dep) < pos(node.name()), "{} must precede {}", dep, node.name());
      }
    }
  }

  #[test]
  fn waves_respect_dependencies() {
    let registry = diamond();
    let graph = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap();
    let waves: Vec<Vec<String>> = graph.waves().iter().map(|w| names(w)).collect();

    assert_eq!(waves.first().map(|w| w.contains(&"zlib".to_string())), Some(true));
    assert_eq!(waves.last(), Some(&vec!["app".to_string()]));

    let wave_of = |n: &str| waves.iter().position(|w| w.iter().any(|x| x == n)).unwrap();
    assert!(wave_of("ssl") < wave_of("net"));
    assert!(wave_of("perl") < wave_of("ssl"));
  }

  #[test]
  fn resolution_is_deterministic() {
    let registry = diamond();
    let a = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap();
    let b = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap();
    assert_eq!(names(&a.build_order()), names(&b.build_order()));
    for node in a.build_order() {
      assert_eq!(node.options, b.node(node.name()).unwrap().options);
    }
  }

  #[test]
  fn runtime_closure_excludes_build_edges() {
    let registry = diamond();
    let graph = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap();
    let closure = graph.runtime_closure("app");
    assert!(closure.contains(&"zlib".to_string()));
    assert!(closure.contains(&"ssl".to_string()));
    assert!(!closure.contains(&"cmake".to_string()));
    assert!(!closure.contains(&"perl".to_string()));
    assert!(graph.contains("perl"));
  }

  #[test]
  fn cycles_report_full_path() {
    let registry = FormulaRegistry::new()
      .with(formula("a").depends_on(DependencySpec::required("b")))
      .unwrap()
      .with(formula("b").depends_on(DependencySpec::required("c")))
      .unwrap()
      .with(formula("c").depends_on(DependencySpec::build("a")))
      .unwrap();

    let err = DependencyGraph::resolve::<&str>("a", &[], &registry, &facts()).unwrap_err();
    match err {
      GraphError::Cycle { path } => {
        assert_eq!(path.0, vec!["a", "b", "c", "a"]);
        assert_eq!(path.to_string(), "a -> b -> c -> a");
      }
      other => panic!("expected cycle, got {other:?}"),
    }
  }

  #[test]
  fn two_node_cycle_is_detected() {
    let registry = FormulaRegistry::new()
      .with(formula("x").depends_on(DependencySpec::required("y")))
      .unwrap()
      .with(formula("y").depends_on(DependencySpec::required("x")))
      .unwrap();
    let err = DependencyGraph::resolve::<&str>("y", &[], &registry, &facts()).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { ref path } if path.0 == vec!["y", "x", "y"]));
  }

  #[test]
  fn differing_option_requests_are_unsatisfiable() {
    let registry = FormulaRegistry::new()
      .with(
        formula("app")
          .depends_on(DependencySpec::required("qt").with_options(&["with-dbus"]))
          .depends_on(DependencySpec::required("viewer")),
      )
      .unwrap()
      .with(formula("viewer").depends_on(DependencySpec::required("qt")))
      .unwrap()
      .with(formula("qt").with_option("with-dbus", "D-Bus support"))
      .unwrap();

    let err = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap_err();
    assert!(matches!(err, GraphError::UnsatisfiableConstraint { ref target, .. } if target == "qt"));
  }

  #[test]
  fn equivalent_option_spellings_are_one_request() {
    let registry = FormulaRegistry::new()
      .with(
        formula("app")
          .depends_on(DependencySpec::required("qt").with_options(&["with-dbus"]))
          .depends_on(DependencySpec::required("viewer")),
      )
      .unwrap()
      .with(formula("viewer").depends_on(DependencySpec::required("qt").with_options(&["--with-dbus"])))
      .unwrap()
      .with(
        formula("player")
          .depends_on(DependencySpec::required("app"))
          .depends_on(DependencySpec::required("qt").with_options(&["dbus"])),
      )
      .unwrap()
      .with(formula("qt").with_option("with-dbus", "D-Bus support"))
      .unwrap();

    let graph = DependencyGraph::resolve::<&str>("player", &[], &registry, &facts()).unwrap();
    assert!(graph.node("qt").unwrap().options.with("dbus"));
  }

  #[test]
  fn opposite_option_requests_conflict() {
    let registry = FormulaRegistry::new()
      .with(
        formula("app")
          .depends_on(DependencySpec::required("qt").with_options(&["with-dbus"]))
          .depends_on(DependencySpec::required("qt-tools")),
      )
      .unwrap()
      .with(formula("qt-tools").depends_on(DependencySpec::required("qt").with_options(&["without-dbus"])))
      .unwrap()
      .with(formula("qt").with_option("with-dbus", "D-Bus support"))
      .unwrap();

    let err = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap_err();
    assert!(matches!(err, GraphError::UnsatisfiableConstraint { ref target, .. } if target == "qt"));
  }

  #[test]
  fn edge_options_resolve_the_target() {
    let registry = FormulaRegistry::new()
      .with(formula("app").depends_on(DependencySpec::required("qt").with_options(&["with-dbus"])))
      .unwrap()
      .with(formula("qt").with_option("with-dbus", "D-Bus support"))
      .unwrap();
    let graph = DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()).unwrap();
    assert!(graph.node("qt").unwrap().options.with("dbus"));
  }

  #[test]
  fn missing_dependency_and_requirements() {
    let registry = FormulaRegistry::new()
      .with(formula("app").depends_on(DependencySpec::required("ghost")))
      .unwrap();
    assert!(matches!(
      DependencyGraph::resolve::<&str>("app", &[], &registry, &facts()),
      Err(GraphError::MissingDependency { ref name, .. }) if name == "ghost"
    ));

    let registry = FormulaRegistry::new()
      .with(formula("tex-doc").depends_on(DependencySpec::new("tool:tex".parse().unwrap(), DepKind::Build)))
      .unwrap();
    assert!(matches!(
      DependencyGraph::resolve::<&str>("tex-doc", &[], &registry, &facts()),
      Err(GraphError::UnsatisfiedRequirement { .. })
    ));
    let with_tex = facts().with_tool("tex");
    assert!(DependencyGraph::resolve::<&str>("tex-doc", &[], &registry, &with_tex).is_ok());
  }

  #[test]
  fn conflicting_formulas_in_one_graph() {
    let registry = FormulaRegistry::new()
      .with(
        formula("graphicsmagick")
          .depends_on(DependencySpec::required("imagemagick"))
          .conflicts_with("imagemagick", Some("both install `convert`")),
      )
      .unwrap()
      .with(formula("imagemagick"))
      .unwrap();
    assert!(matches!(
      DependencyGraph::resolve::<&str>("graphicsmagick", &[], &registry, &facts()),
      Err(GraphError::FormulaConflict { .. })
    ));
  }
}
