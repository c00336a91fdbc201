//! Build sandbox executor.
//!
//! A [`BuildContext`] is created once per build attempt and thrown away
//! afterwards. It owns the build workspace, the [`BuildEnv`] sub-processes
//! see, the install locations and the formula's resources. Procedures only
//! touch the outside world through it.
//!
//! Sub-processes run with a cleared environment:
//! - only allow-listed ambient variables (`PATH`, `CC`, ...) are passed through
//! - `HOME` and `TMPDIR` point inside the workspace
//! - `LANG=C`, `SOURCE_DATE_EPOCH`, `MAKEFLAGS=-jN` and `CELLAR_PREFIX` are fixed
//! - the selected compiler is exported as `CC` / `CXX`

pub mod command;
pub mod env;
pub mod paths;
pub mod procedure;

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::consts::OPT_DIR;
use crate::fetch::{FetchError, FetchOptions, Fetcher};
use crate::formula::{CompilerFailure, Resource};
use crate::layout::InstallationRecord;
use crate::options::ResolvedOptions;
use crate::placeholder::{PlaceholderError, Resolver};
use crate::platform::{Compiler, PlatformFacts};

pub use command::CommandOutput;
pub use env::BuildEnv;
pub use paths::InstallPaths;
pub use procedure::{InstallProcedure, ScriptedProcedure, Step, StepAction, TestProcedure};

/// Bytes of command output kept in a `CommandFailed` error.
const OUTPUT_TAIL: usize = 4096;

/// Errors raised while running a procedure.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("command failed with exit code {code:?}: {command}\n{output}")]
  CommandFailed {
    command: String,
    code: Option<i32>,
    output: String,
  },

  #[error("command timed out after {timeout:?}: {command}")]
  Timeout { command: String, timeout: Duration },

  #[error("unexpected output from {command}: expected '{expected}', got '{actual}'")]
  UnexpectedOutput {
    command: String,
    expected: String,
    actual: String,
  },

  #[error("unknown resource '{0}'")]
  ResourceNotFound(String),

  #[error("inreplace failed: '{pattern}' not found in {path}")]
  InreplaceNoMatch { path: PathBuf, pattern: String },

  #[error("nothing to install: {0} does not exist")]
  MissingInstallSource(PathBuf),

  #[error("'{0}' escapes the build workspace")]
  OutsideWorkspace(String),

  #[error("{formula}: no compatible compiler available")]
  NoCompatibleCompiler { formula: String },

  #[error("{formula}: install procedure produced no files")]
  EmptyInstall { formula: String },

  #[error("{0}")]
  Procedure(String),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Placeholder(#[from] PlaceholderError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl From<walkdir::Error> for BuildError {
  fn from(err: walkdir::Error) -> Self {
    BuildError::Io(err.into())
  }
}

/// A self-test that did not pass. Reported as a warning; the install stands.
#[derive(Debug, Error)]
pub enum TestFailure {
  #[error("{formula}: test failed: {source}")]
  Failed {
    formula: String,
    #[source]
    source: BuildError,
  },

  #[error("{formula}: test had {count} failed command(s)")]
  FailedCommands { formula: String, count: usize },

  #[error("{formula}: could not create test directory: {source}")]
  Setup {
    formula: String,
    #[source]
    source: std::io::Error,
  },
}

/// What a successful install procedure left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifacts {
  /// Root the procedure installed into.
  pub root: PathBuf,
  /// Installed files and symlinks, relative to `root`, sorted.
  pub files: Vec<PathBuf>,
  /// Commands run, in order.
  pub commands: Vec<String>,
}

/// Per-attempt state handed to install and test procedures.
pub struct BuildContext {
  name: String,
  version: String,
  options: ResolvedOptions,
  facts: PlatformFacts,
  paths: InstallPaths,
  env: BuildEnv,
  workspace: PathBuf,
  cwd: PathBuf,
  opt_root: PathBuf,
  timeout: Duration,
  resources: Vec<Resource>,
  fetcher: Option<Arc<Fetcher>>,
  compiler: Option<Compiler>,
  failed_commands: usize,
  commands: Vec<String>,
}

impl BuildContext {
  pub fn new(
    name: &str,
    version: &str,
    options: ResolvedOptions,
    paths: InstallPaths,
    workspace: &Path,
    config: &Config,
    facts: &PlatformFacts,
  ) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      options,
      facts: facts.clone(),
      paths,
      env: BuildEnv::isolated(&config.env_allow_list, workspace, &config.prefix, config.make_jobs),
      workspace: workspace.to_path_buf(),
      cwd: workspace.to_path_buf(),
      opt_root: config.prefix.join(OPT_DIR),
      timeout: config.command_timeout,
      resources: Vec::new(),
      fetcher: None,
      compiler: None,
      failed_commands: 0,
      commands: Vec::new(),
    }
  }

  /// Resources `stage_resource` may fetch, and the fetcher to fetch them with.
  pub fn with_resources(mut self, resources: Vec<Resource>, fetcher: Arc<Fetcher>) -> Self {
    self.resources = resources;
    self.fetcher = Some(fetcher);
    self
  }

  /// Export `compiler` as `CC` / `CXX`.
  pub fn with_compiler(mut self, compiler: Option<Compiler>) -> Self {
    if let Some(compiler) = &compiler {
      let (cc, cxx) = compiler.executables();
      self.env.set("CC", cc);
      self.env.set("CXX", cxx);
    }
    self.compiler = compiler;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn options(&self) -> &ResolvedOptions {
    &self.options
  }

  pub fn facts(&self) -> &PlatformFacts {
    &self.facts
  }

  pub fn paths(&self) -> &InstallPaths {
    &self.paths
  }

  pub fn env(&self) -> &BuildEnv {
    &self.env
  }

  pub fn workspace(&self) -> &Path {
    &self.workspace
  }

  pub fn cwd(&self) -> &Path {
    &self.cwd
  }

  pub fn compiler(&self) -> Option<&Compiler> {
    self.compiler.as_ref()
  }

  /// Commands run so far, in order.
  pub fn commands(&self) -> &[String] {
    &self.commands
  }

  /// Opt alias of another formula under the shared prefix.
  pub fn opt_prefix(&self, formula: &str) -> PathBuf {
    self.opt_root.join(formula)
  }

  pub fn set_env(&mut self, key: &str, value: &str) {
    self.env.set(key, value);
  }

  pub fn append_env(&mut self, key: &str, value: &str, separator: &str) {
    self.env.append(key, value, separator);
  }

  pub fn append_to_cflags(&mut self, flags: &str) {
    self.env.append_to_cflags(flags);
  }

  pub fn deparallelize(&mut self) {
    self.env.deparallelize();
  }

  /// Change the working directory to `dir` (relative to the workspace).
  /// Returns the previous one.
  pub fn set_cwd(&mut self, dir: &str) -> Result<PathBuf, BuildError> {
    let target = self.workspace.join(confine(dir)?);
    if !target.is_dir() {
      return Err(BuildError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} is not a directory", target.display()),
      )));
    }
    Ok(std::mem::replace(&mut self.cwd, target))
  }

  pub fn restore_cwd(&mut self, previous: PathBuf) {
    self.cwd = previous;
  }

  /// Run a program; a non-zero exit is a `CommandFailed` error.
  pub async fn system(&mut self, program: &str, args: &[String]) -> Result<CommandOutput, BuildError> {
    let output = match self.system_tolerant(program, args).await {
      Ok(output) => output,
      Err(err) => {
        self.failed_commands += 1;
        return Err(err);
      }
    };
    if !output.success() {
      self.failed_commands += 1;
      return Err(BuildError::CommandFailed {
        command: command::display_command(program, args),
        code: output.code,
        output: output.combined_tail(OUTPUT_TAIL),
      });
    }
    Ok(output)
  }

  /// Run a program and return its output whatever its exit status.
  pub async fn system_tolerant(&mut self, program: &str, args: &[String]) -> Result<CommandOutput, BuildError> {
    self.commands.push(command::display_command(program, args));
    command::run(program, args, &self.cwd, &self.env, self.timeout).await
  }

  /// Run a `/bin/sh -c` script; a non-zero exit is an error.
  pub async fn shell(&mut self, script: &str) -> Result<CommandOutput, BuildError> {
    self.system("/bin/sh", &["-c".to_string(), script.to_string()]).await
  }

  /// Run a program and return its trimmed stdout.
  pub async fn capture(&mut self, program: &str, args: &[String]) -> Result<String, BuildError> {
    Ok(self.system(program, args).await?.stdout.trim().to_string())
  }

  fn resolve_in_cwd(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.cwd.join(path)
    }
  }

  /// Copy `src` (file or directory, relative to the working directory) into `dest_dir`.
  pub fn install(&self, src: &str, dest_dir: &Path) -> Result<PathBuf, BuildError> {
    let source = self.resolve_in_cwd(Path::new(src));
    let Some(file_name) = source.file_name() else {
      return Err(BuildError::MissingInstallSource(source));
    };
    let file_name = file_name.to_os_string();
    self.copy_into(&source, dest_dir, &file_name.to_string_lossy())
  }

  /// Copy `src` into `dest_dir` under `name`.
  pub fn install_as(&self, src: &str, dest_dir: &Path, name: &str) -> Result<PathBuf, BuildError> {
    let source = self.resolve_in_cwd(Path::new(src));
    self.copy_into(&source, dest_dir, name)
  }

  fn copy_into(&self, source: &Path, dest_dir: &Path, name: &str) -> Result<PathBuf, BuildError> {
    if !source.exists() {
      return Err(BuildError::MissingInstallSource(source.to_path_buf()));
    }
    let dest_dir = self.resolve_in_cwd(dest_dir);
    fs::create_dir_all(&dest_dir)?;
    let target = dest_dir.join(name);

    if source.is_dir() {
      copy_tree(source, &target)?;
    } else {
      fs::copy(source, &target)?;
    }
    debug!(src = %source.display(), dest = %target.display(), "installed");
    Ok(target)
  }

  /// Write `contents` to `path` (relative to the working directory), creating parents.
  pub fn write_file(&self, path: &Path, contents: &str) -> Result<(), BuildError> {
    let path = self.resolve_in_cwd(path);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    Ok(())
  }

  /// Replace every occurrence of `from` with `to` in `path`. Fails when
  /// nothing matched.
  pub fn inreplace(&self, path: &Path, from: &str, to: &str) -> Result<(), BuildError> {
    let path = self.resolve_in_cwd(path);
    let contents = fs::read_to_string(&path)?;
    if from.is_empty() || !contents.contains(from) {
      return Err(BuildError::InreplaceNoMatch {
        path,
        pattern: from.to_string(),
      });
    }
    fs::write(&path, contents.replace(from, to))?;
    Ok(())
  }

  /// Fetch and unpack a declared resource into a sub-workspace, returning its path.
  ///
  /// Resources are fetched only when staged.
  pub async fn stage_resource(&self, name: &str) -> Result<PathBuf, BuildError> {
    let resource = self
      .resources
      .iter()
      .find(|r| r.name == name)
      .ok_or_else(|| BuildError::ResourceNotFound(name.to_string()))?;
    let fetcher = self
      .fetcher
      .as_ref()
      .ok_or_else(|| BuildError::ResourceNotFound(name.to_string()))?;

    let relative = match &resource.destination {
      Some(dest) => confine(dest)?,
      None => PathBuf::from(".resources").join(&resource.name),
    };
    let dest = self.workspace.join(relative);

    info!(formula = %self.name, resource = %name, dest = %dest.display(), "staging resource");
    fetcher.fetch(&resource.source, &dest, FetchOptions::default()).await?;
    Ok(dest)
  }
}

impl Resolver for BuildContext {
  fn resolve_path(&self, name: &str) -> Result<String, PlaceholderError> {
    self
      .paths
      .get(name)
      .map(|p| p.display().to_string())
      .ok_or_else(|| PlaceholderError::Unknown(name.to_string()))
  }

  fn resolve_version(&self) -> &str {
    &self.version
  }

  fn resolve_name(&self) -> &str {
    &self.name
  }

  fn resolve_buildpath(&self) -> String {
    self.workspace.display().to_string()
  }

  fn resolve_jobs(&self) -> usize {
    self.env.make_jobs()
  }

  fn resolve_opt(&self, formula: &str) -> Result<String, PlaceholderError> {
    let path = self.opt_prefix(formula);
    if path.symlink_metadata().is_err() {
      return Err(PlaceholderError::UnresolvedOpt(formula.to_string()));
    }
    Ok(path.display().to_string())
  }
}

/// A relative path that stays inside its base directory.
fn confine(relative: &str) -> Result<PathBuf, BuildError> {
  let path = Path::new(relative);
  if path
    .components()
    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
  {
    Ok(path.to_path_buf())
  } else {
    Err(BuildError::OutsideWorkspace(relative.to_string()))
  }
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), BuildError> {
  for entry in WalkDir::new(source).follow_links(false) {
    let entry = entry?;
    let Ok(relative) = entry.path().strip_prefix(source) else {
      continue;
    };
    let dest = target.join(relative);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&dest)?;
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path())?;
      #[cfg(unix)]
      std::os::unix::fs::symlink(link, &dest)?;
      #[cfg(not(unix))]
      fs::copy(entry.path().parent().unwrap_or(source).join(link), &dest)?;
    } else {
      fs::copy(entry.path(), &dest)?;
    }
  }
  Ok(())
}

/// Files and symlinks under `root`, relative and sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, BuildError> {
  let mut files = Vec::new();
  for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
    let entry = entry?;
    if entry.file_type().is_dir() {
      continue;
    }
    if let Ok(relative) = entry.path().strip_prefix(root) {
      files.push(relative.to_path_buf());
    }
  }
  Ok(files)
}

/// The first compiler from `facts` that no `fails_with` entry rules out.
///
/// `Ok(None)` when the host lists no compilers at all.
pub fn select_compiler(
  formula: &str,
  facts: &PlatformFacts,
  failures: &[CompilerFailure],
) -> Result<Option<Compiler>, BuildError> {
  if facts.compilers.is_empty() {
    return Ok(None);
  }
  for compiler in &facts.compilers {
    if let Some(failure) = failures.iter().find(|f| f.matches(compiler)) {
      debug!(formula, compiler = %compiler.name, cause = ?failure.cause, "compiler excluded");
      continue;
    }
    return Ok(Some(compiler.clone()));
  }
  Err(BuildError::NoCompatibleCompiler {
    formula: formula.to_string(),
  })
}

/// Run an install procedure and collect what it installed.
pub async fn execute(procedure: &dyn InstallProcedure, ctx: &mut BuildContext) -> Result<BuildArtifacts, BuildError> {
  let root = ctx.paths.prefix.clone();
  tokio::fs::create_dir_all(&root).await?;

  info!(formula = %ctx.name, version = %ctx.version, "running install procedure");
  procedure.install(ctx).await?;

  let files = list_files(&root)?;
  if files.is_empty() {
    return Err(BuildError::EmptyInstall {
      formula: ctx.name.clone(),
    });
  }

  Ok(BuildArtifacts {
    root,
    files,
    commands: ctx.commands.clone(),
  })
}

/// Run a self-test against an installed keg in a fresh temporary directory.
///
/// Passes when the procedure returns `Ok` and no command it ran failed,
/// even if the procedure swallowed the error.
pub async fn run_test(
  procedure: &dyn TestProcedure,
  record: &InstallationRecord,
  config: &Config,
  facts: &PlatformFacts,
) -> Result<(), TestFailure> {
  let testpath = tempfile::Builder::new()
    .prefix(&format!("{}-test-", record.name))
    .tempdir()
    .map_err(|source| TestFailure::Setup {
      formula: record.name.clone(),
      source,
    })?;

  let paths = InstallPaths::new(&record.root, &record.name);
  let mut ctx = BuildContext::new(
    &record.name,
    &record.version,
    record.options.clone(),
    paths,
    testpath.path(),
    config,
    facts,
  );

  info!(formula = %record.name, testpath = %testpath.path().display(), "running test");
  let result = procedure.test(&mut ctx).await;

  match result {
    Err(source) => {
      warn!(formula = %record.name, error = %source, "test failed");
      Err(TestFailure::Failed {
        formula: record.name.clone(),
        source,
      })
    }
    Ok(()) if ctx.failed_commands > 0 => Err(TestFailure::FailedCommands {
      formula: record.name.clone(),
      count: ctx.failed_commands,
    }),
    Ok(()) => Ok(()),
  }
}
