//! The per-node install pipeline.
//!
//! One node goes through either pour (bottle) or fetch, patch and build, and
//! then materialize, link, opt alias and registry promotion. Nothing is
//! visible in the registry until every earlier step succeeded, and a failed
//! promotion puts the previous keg back in place.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bottle;
use crate::fetch::FetchOptions;
use crate::formula::{DownloadStrategy, PatchSpec, PredicateEnv, SourceSpec, Variant};
use crate::graph::GraphNode;
use crate::layout::{InstallationRecord, KegDetails, KegIdentity, Layout, LayoutError, Staging, head_version};
use crate::patch;
use crate::sandbox::{self, BuildContext, InstallPaths};

use super::Session;
use super::types::{Installed, NodeError, Provenance};

/// Everything a node needs from its place in the graph.
#[derive(Debug, Clone)]
pub(crate) struct NodeJob {
  pub node: GraphNode,
  pub runtime_dependencies: Vec<String>,
}

impl NodeJob {
  pub fn name(&self) -> &str {
    self.node.name()
  }

  fn source(&self) -> Result<&SourceSpec, NodeError> {
    let variant = self.node.options.variant;
    self.node.formula.source(variant).ok_or_else(|| self.missing_source())
  }

  fn version(&self) -> Result<String, NodeError> {
    self
      .node
      .formula
      .version_for(self.node.options.variant)
      .ok_or_else(|| self.missing_source())
  }

  fn missing_source(&self) -> NodeError {
    NodeError::MissingSource {
      formula: self.name().to_string(),
      variant: self.node.options.variant,
    }
  }

  /// The keg identity when it is known without fetching: a declared digest
  /// for file sources. Git and head sources are only known after checkout.
  pub fn planned_identity(&self) -> Result<Option<KegIdentity>, NodeError> {
    let source = self.source()?;
    if self.node.options.variant == Variant::Head || source.strategy == DownloadStrategy::Git {
      return Ok(None);
    }
    let Some(checksum) = &source.checksum else {
      return Ok(None);
    };
    Ok(Some(KegIdentity {
      name: self.name().to_string(),
      version: self.version()?,
      options: self.node.options.clone(),
      source_digest: Some(checksum.to_string()),
      revision: None,
    }))
  }

  /// Key used to deduplicate concurrent requests for the same keg.
  pub fn flight_key(&self) -> String {
    let planned = self.planned_identity().ok().flatten().and_then(|id| id.fingerprint().ok());
    match planned {
      Some(fingerprint) => format!("{}/{}", self.name(), fingerprint),
      None => format!(
        "{}/{}/{}",
        self.name(),
        self.node.options.variant,
        self.node.options.fingerprint()
      ),
    }
  }

  fn active_patches(&self, session: &Session) -> Vec<&PatchSpec> {
    let options = &self.node.options;
    let env = PredicateEnv {
      variant: options.variant,
      enabled: &options.enabled,
      universal: options.universal,
      facts: &session.facts,
    };
    self
      .node
      .formula
      .patches_for(options.variant)
      .into_iter()
      .filter(|p| p.when.as_ref().is_none_or(|w| w.evaluate(&env)))
      .collect()
  }

  fn details(&self, poured: bool) -> KegDetails {
    KegDetails {
      runtime_dependencies: self.runtime_dependencies.clone(),
      keg_only: self.node.formula.is_keg_only(),
      poured_from_bottle: poured,
    }
  }
}

fn registered(session: &Session, identity: &KegIdentity) -> Result<Option<InstallationRecord>, NodeError> {
  let key = crate::layout::keg_key(&identity.version, &identity.fingerprint()?);
  Ok(session.registry.get(&identity.name, &key))
}

/// Install one node. Returns the registered record.
pub(crate) async fn install_node(session: &Session, job: &NodeJob) -> Result<Installed, NodeError> {
  let name = job.name();

  if let Some(identity) = job.planned_identity()?
    && let Some(record) = registered(session, &identity)?
  {
    info!(formula = name, key = %record.key(), "already installed");
    return Ok(Installed {
      record,
      provenance: Provenance::AlreadyInstalled,
    });
  }

  if let Some(installed) = pour_bottle(session, job).await? {
    return Ok(installed);
  }
  build_from_source(session, job).await
}

async fn pour_bottle(session: &Session, job: &NodeJob) -> Result<Option<Installed>, NodeError> {
  if session.config.build_from_source {
    return Ok(None);
  }
  let version = job.version()?;
  let Some(artifact) = bottle::select(
    &job.node.formula,
    &version,
    &job.node.options,
    &session.facts,
    &session.bottles,
  ) else {
    return Ok(None);
  };
  let source = job.source()?;

  let staging = session.layout.stage(job.name())?;
  bottle::pour(&artifact, staging.path(), &session.fetcher).await?;

  let identity = KegIdentity {
    name: job.name().to_string(),
    version,
    options: job.node.options.clone(),
    source_digest: source.checksum.as_ref().map(|c| c.to_string()),
    revision: None,
  };
  let record = promote(session, job, staging, &identity, true)?;
  Ok(Some(Installed {
    record,
    provenance: Provenance::Poured,
  }))
}

async fn build_from_source(session: &Session, job: &NodeJob) -> Result<Installed, NodeError> {
  let name = job.name();
  let formula = &job.node.formula;
  let options = &job.node.options;
  let source = job.source()?;

  let builds_dir = session.config.builds_dir();
  tokio::fs::create_dir_all(&builds_dir).await.map_err(NodeError::Workspace)?;
  let workspace = tempfile::Builder::new()
    .prefix(&format!("{}-", name))
    .tempdir_in(&builds_dir)
    .map_err(NodeError::Workspace)?;

  let fetch_options = FetchOptions {
    skip_verification: options.variant == Variant::Head,
    ..Default::default()
  };
  let verified = session.fetcher.fetch(source, workspace.path(), fetch_options).await?;

  let version = match (options.variant, &verified.revision) {
    (Variant::Head, Some(revision)) => head_version(revision),
    _ => job.version()?,
  };
  let identity = KegIdentity {
    name: name.to_string(),
    version: version.clone(),
    options: options.clone(),
    source_digest: verified.digest.clone(),
    revision: verified.revision.clone(),
  };
  if let Some(record) = registered(session, &identity)? {
    info!(formula = name, key = %record.key(), "resolved revision already installed");
    return Ok(Installed {
      record,
      provenance: Provenance::AlreadyInstalled,
    });
  }

  let patches = job.active_patches(session);
  if !patches.is_empty() {
    let applied = patch::apply(&patches, workspace.path(), &session.fetcher).await?;
    debug!(formula = name, patches = applied.count, files = applied.files.len(), "patched source");
  }

  let compiler = sandbox::select_compiler(name, &session.facts, &formula.fails_with)?;

  let staging = session.layout.stage(name)?;
  let paths = InstallPaths::new(staging.path(), name);
  let resources = formula.resources_for(options.variant).into_iter().cloned().collect();
  let mut ctx = BuildContext::new(
    name,
    &version,
    options.clone(),
    paths,
    workspace.path(),
    &session.config,
    &session.facts,
  )
  .with_resources(resources, Arc::clone(&session.fetcher))
  .with_compiler(compiler);

  let artifacts = sandbox::execute(formula.install.as_ref(), &mut ctx).await?;
  debug!(formula = name, files = artifacts.files.len(), commands = artifacts.commands.len(), "build finished");

  let record = promote(session, job, staging, &identity, false)?;
  Ok(Installed {
    record,
    provenance: Provenance::Built,
  })
}

/// Materialize, link, switch the opt alias and register.
///
/// If anything after materialize fails, the links and opt alias of the
/// previously active keg are restored and the new keg is removed.
fn promote(
  session: &Session,
  job: &NodeJob,
  staging: Staging,
  identity: &KegIdentity,
  poured: bool,
) -> Result<InstallationRecord, NodeError> {
  let previous = session.registry.active(job.name());
  let record = session.layout.materialize(staging, identity, job.details(poured))?;

  if let Err(e) = publish(session, &record) {
    warn!(formula = %record.name, error = %e, "promotion failed, restoring previous keg");
    restore(session, &record, previous.as_ref());
    return Err(e);
  }
  Ok(record)
}

fn publish(session: &Session, record: &InstallationRecord) -> Result<(), NodeError> {
  let layout = &session.layout;
  if !record.keg_only {
    layout.link(record)?;
  }
  layout.set_opt(&record.name, &record.root)?;
  session.registry.promote(record)?;
  Ok(())
}

fn restore(session: &Session, record: &InstallationRecord, previous: Option<&InstallationRecord>) {
  if let Err(e) = relink_previous(&session.layout, &record.name, previous) {
    error!(formula = %record.name, error = %e, "failed to restore previous links");
  }
  // a registered key is never removed
  if session.registry.contains(&record.name, &record.key()) {
    return;
  }
  if let Err(e) = std::fs::remove_dir_all(&record.root) {
    error!(keg = %record.root.display(), error = %e, "failed to remove unregistered keg");
  }
}

fn relink_previous(layout: &Layout, name: &str, previous: Option<&InstallationRecord>) -> Result<(), LayoutError> {
  layout.unlink(name)?;
  match previous {
    Some(prev) => {
      if !prev.keg_only {
        layout.link(prev)?;
      }
      layout.set_opt(name, &prev.root)?;
    }
    None => layout.remove_opt(name)?,
  }
  Ok(())
}
