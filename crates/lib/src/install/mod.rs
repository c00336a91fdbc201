//! Install orchestration.
//!
//! An [`Installer`] is one install session on a prefix. It holds the
//! exclusive prefix lock for its whole lifetime and drives resolved graphs
//! through the per-node pipeline:
//! - waves run one after another; a node starts only after all of its
//!   dependencies finished successfully
//! - nodes within a wave run in parallel, bounded by `config.parallelism`
//! - a failed node skips every node that depends on it
//! - concurrent requests for the same keg (also across `install` calls on a
//!   shared installer) build once and share the result

mod node;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bottle::PrebuiltArtifact;
use crate::config::Config;
use crate::fetch::Fetcher;
use crate::formula::FormulaRegistry;
use crate::graph::{DependencyGraph, GraphError};
use crate::layout::Layout;
use crate::platform::PlatformFacts;
use crate::prefix_lock::{LockMode, PrefixLock};
use crate::registry::{InFlight, Registry};
use crate::sandbox;

use node::NodeJob;

pub use types::{InstallError, InstallReport, Installed, NodeError, Provenance, Skipped};

type NodeResult = Result<Installed, Arc<NodeError>>;

/// State shared by every task of a session.
pub(crate) struct Session {
  pub config: Config,
  pub facts: PlatformFacts,
  pub formulas: FormulaRegistry,
  pub fetcher: Arc<Fetcher>,
  pub layout: Layout,
  pub registry: Registry,
  pub bottles: Vec<PrebuiltArtifact>,
  flights: InFlight<String, NodeResult>,
  _lock: PrefixLock,
}

/// An install session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Installer {
  session: Arc<Session>,
}

impl Installer {
  /// Lock the prefix of `config` and load its registry.
  pub fn open(config: Config, facts: PlatformFacts, formulas: FormulaRegistry) -> Result<Self, InstallError> {
    Self::open_for(config, facts, formulas, "cellar install")
  }

  /// Like [`Installer::open`], recording `command` in the lock metadata.
  pub fn open_for(
    config: Config,
    facts: PlatformFacts,
    formulas: FormulaRegistry,
    command: &str,
  ) -> Result<Self, InstallError> {
    let lock = PrefixLock::acquire(&config.prefix, LockMode::Exclusive, command)?;
    let registry = Registry::open(&config.prefix)?;
    let fetcher = Fetcher::new(&config).map_err(InstallError::Setup)?;

    info!(prefix = %config.prefix.display(), formulas = formulas.len(), "opened install session");
    Ok(Self {
      session: Arc::new(Session {
        layout: Layout::new(config.prefix.clone()),
        fetcher: Arc::new(fetcher),
        registry,
        bottles: Vec::new(),
        flights: InFlight::new(),
        formulas,
        facts,
        config,
        _lock: lock,
      }),
    })
  }

  /// Prebuilt artifacts to prefer over building. Must be set before the
  /// installer is cloned.
  pub fn with_bottles(mut self, bottles: Vec<PrebuiltArtifact>) -> Self {
    if let Some(session) = Arc::get_mut(&mut self.session) {
      session.bottles = bottles;
    } else {
      warn!("installer already shared, ignoring bottles");
    }
    self
  }

  pub fn config(&self) -> &Config {
    &self.session.config
  }

  pub fn registry(&self) -> &Registry {
    &self.session.registry
  }

  pub fn layout(&self) -> &Layout {
    &self.session.layout
  }

  pub fn formulas(&self) -> &FormulaRegistry {
    &self.session.formulas
  }

  /// Resolve `name` with `flags` into a dependency graph.
  pub fn resolve<S: AsRef<str>>(&self, name: &str, flags: &[S]) -> Result<DependencyGraph, GraphError> {
    DependencyGraph::resolve(name, flags, &self.session.formulas, &self.session.facts)
  }

  /// Resolve and install `name`. Resolution errors are returned before
  /// anything is fetched or built; node failures are in the report.
  pub async fn install<S: AsRef<str>>(&self, name: &str, flags: &[S]) -> Result<InstallReport, InstallError> {
    let graph = self.resolve(name, flags)?;
    Ok(self.install_graph(&graph).await)
  }

  /// Install every node of `graph`, wave by wave.
  pub async fn install_graph(&self, graph: &DependencyGraph) -> InstallReport {
    let waves = graph.waves();
    info!(root = %graph.root().name(), nodes = graph.len(), waves = waves.len(), "starting install");

    let semaphore = Arc::new(Semaphore::new(self.session.config.parallelism.max(1)));
    let mut report = InstallReport::default();
    let mut failed: HashSet<String> = HashSet::new();

    for (wave_idx, wave) in waves.iter().enumerate() {
      debug!(wave = wave_idx, nodes = wave.len(), "executing wave");
      let mut tasks = JoinSet::new();

      for node in wave {
        let name = node.name().to_string();
        let failed_dep = graph
          .dependencies(&name)
          .into_iter()
          .find(|(dep, _)| failed.contains(*dep))
          .map(|(dep, _)| dep.to_string());
        if let Some(dependency) = failed_dep {
          warn!(formula = %name, dependency = %dependency, "skipping, dependency failed");
          report.skipped.push(Skipped {
            name: name.clone(),
            dependency,
          });
          failed.insert(name);
          continue;
        }

        let job = NodeJob {
          node: (*node).clone(),
          runtime_dependencies: graph.runtime_closure(&name),
        };
        let installer = self.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
          let result = match semaphore.acquire_owned().await {
            Ok(_permit) => installer.run_job(&job).await,
            Err(e) => Err(Arc::new(NodeError::Aborted(e.to_string()))),
          };
          (job, result)
        });
      }

      let mut pending: HashSet<String> = wave.iter().map(|n| n.name().to_string()).collect();
      pending.retain(|name| !failed.contains(name));

      while let Some(joined) = tasks.join_next().await {
        let (job, result) = match joined {
          Ok(done) => done,
          Err(e) => {
            error!(error = %e, "install task panicked");
            continue;
          }
        };
        pending.remove(job.name());
        match result {
          Ok(installed) => {
            info!(formula = %installed.record.name, key = %installed.record.key(), how = %installed.provenance, "installed");
            if let Some(warning) = self.self_test(&job, &installed).await {
              report.test_warnings.push(warning);
            }
            report.installed.push(installed);
          }
          Err(e) => {
            error!(formula = %job.name(), error = %e, "install failed");
            failed.insert(job.name().to_string());
            report.failed.push((job.name().to_string(), e));
          }
        }
      }

      // tasks that panicked never reported back
      for name in pending {
        failed.insert(name.clone());
        report
          .failed
          .push((name, Arc::new(NodeError::Aborted("install task panicked".to_string()))));
      }
    }

    info!(
      installed = report.installed.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "install finished"
    );
    report
  }

  /// Run a node through the in-flight map so concurrent requests for the same
  /// keg build once.
  async fn run_job(&self, job: &NodeJob) -> NodeResult {
    let key = job.flight_key();
    let session = &self.session;
    let (result, leader) = session
      .flights
      .run(key, || async move { node::install_node(session, job).await.map_err(Arc::new) })
      .await;

    match result {
      Ok(installed) if !leader => Ok(Installed {
        provenance: Provenance::Shared,
        ..installed
      }),
      other => other,
    }
  }

  async fn self_test(&self, job: &NodeJob, installed: &Installed) -> Option<sandbox::TestFailure> {
    let session = &self.session;
    let fresh = matches!(installed.provenance, Provenance::Built | Provenance::Poured);
    if !session.config.run_tests || !fresh {
      return None;
    }
    let procedure = job.node.formula.test.as_deref()?;
    sandbox::run_test(procedure, &installed.record, &session.config, &session.facts)
      .await
      .err()
  }

  /// Run the self-test of the active keg of `name`.
  pub async fn test(&self, name: &str) -> Result<(), InstallError> {
    let session = &self.session;
    let record = session
      .registry
      .active(name)
      .ok_or_else(|| InstallError::NotInstalled(name.to_string()))?;
    let formula = session
      .formulas
      .get(name)
      .ok_or_else(|| InstallError::NotInstalled(name.to_string()))?;
    let Some(procedure) = formula.test.as_deref() else {
      info!(formula = name, "no test defined");
      return Ok(());
    };
    sandbox::run_test(procedure, &record, &session.config, &session.facts).await?;
    Ok(())
  }
}
