//! Install and self-test procedures.
//!
//! Procedures are the formula's code: they drive the build through a
//! [`BuildContext`]. Programmatic formulas implement the traits directly;
//! descriptor formulas get a [`ScriptedProcedure`] built from their step lists.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::formula::{Predicate, PredicateEnv};
use crate::placeholder::substitute;

use super::{BuildContext, BuildError};

/// Builds and installs a formula into `ctx.paths()`.
#[async_trait]
pub trait InstallProcedure: Send + Sync {
  async fn install(&self, ctx: &mut BuildContext) -> Result<(), BuildError>;
}

/// Exercises an installed keg. Runs in an ephemeral directory.
#[async_trait]
pub trait TestProcedure: Send + Sync {
  async fn test(&self, ctx: &mut BuildContext) -> Result<(), BuildError>;
}

fn default_separator() -> String {
  " ".to_string()
}

/// One operation of a scripted procedure.
///
/// String fields accept `$${...}` placeholders.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepAction {
  /// Run a program; a non-zero exit fails the step unless `ignore_failure`.
  System {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    ignore_failure: bool,
  },
  /// Run a script with `/bin/sh -c`.
  Shell { script: String },
  SetEnv { key: String, value: String },
  AppendEnv {
    key: String,
    value: String,
    #[serde(default = "default_separator")]
    separator: String,
  },
  AppendToCflags { flags: String },
  Deparallelize,
  /// Copy `src` (relative to the working directory) into the directory `dest`,
  /// optionally under a new name.
  Install {
    src: String,
    dest: String,
    #[serde(default)]
    rename: Option<String>,
  },
  WriteFile { path: String, contents: String },
  Inreplace { path: String, from: String, to: String },
  StageResource { name: String },
  /// Run a program and require its stdout to contain `expect`.
  AssertOutput {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    expect: String,
  },
}

/// A step with its optional condition and working directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
  #[serde(flatten)]
  pub action: StepAction,
  #[serde(default)]
  pub when: Option<Predicate>,
  /// Working directory relative to the build workspace.
  #[serde(default)]
  pub cwd: Option<String>,
}

impl Step {
  pub fn new(action: StepAction) -> Self {
    Self {
      action,
      when: None,
      cwd: None,
    }
  }

  pub fn when(mut self, predicate: Predicate) -> Self {
    self.when = Some(predicate);
    self
  }

  pub fn in_dir(mut self, cwd: &str) -> Self {
    self.cwd = Some(cwd.to_string());
    self
  }
}

/// A procedure that runs a list of steps in order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ScriptedProcedure {
  pub steps: Vec<Step>,
}

impl ScriptedProcedure {
  pub fn new(steps: Vec<Step>) -> Self {
    Self { steps }
  }

  async fn run(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
    for (index, step) in self.steps.iter().enumerate() {
      let active = match &step.when {
        None => true,
        Some(predicate) => {
          let options = ctx.options();
          predicate.evaluate(&PredicateEnv {
            variant: options.variant,
            enabled: &options.enabled,
            universal: options.universal,
            facts: ctx.facts(),
          })
        }
      };
      if !active {
        debug!(formula = %ctx.name(), index, "skipping step");
        continue;
      }

      let previous = match &step.cwd {
        Some(dir) => {
          let dir = substitute(dir, &*ctx)?;
          Some(ctx.set_cwd(&dir)?)
        }
        None => None,
      };

      let result = run_action(&step.action, ctx).await;

      if let Some(previous) = previous {
        ctx.restore_cwd(previous);
      }
      result?;
    }
    Ok(())
  }
}

async fn run_action(action: &StepAction, ctx: &mut BuildContext) -> Result<(), BuildError> {
  match action {
    StepAction::System {
      command,
      args,
      ignore_failure,
    } => {
      let command = sub(ctx, command)?;
      let args = sub_all(ctx, args)?;
      if *ignore_failure {
        ctx.system_tolerant(&command, &args).await?;
      } else {
        ctx.system(&command, &args).await?;
      }
    }
    StepAction::Shell { script } => {
      let script = sub(ctx, script)?;
      ctx.shell(&script).await?;
    }
    StepAction::SetEnv { key, value } => {
      let value = sub(ctx, value)?;
      ctx.set_env(key, &value);
    }
    StepAction::AppendEnv { key, value, separator } => {
      let value = sub(ctx, value)?;
      ctx.append_env(key, &value, separator);
    }
    StepAction::AppendToCflags { flags } => {
      let flags = sub(ctx, flags)?;
      ctx.append_to_cflags(&flags);
    }
    StepAction::Deparallelize => ctx.deparallelize(),
    StepAction::Install { src, dest, rename } => {
      let src = sub(ctx, src)?;
      let dest = sub(ctx, dest)?;
      match rename {
        Some(name) => {
          let name = sub(ctx, name)?;
          ctx.install_as(&src, Path::new(&dest), &name)?;
        }
        None => {
          ctx.install(&src, Path::new(&dest))?;
        }
      }
    }
    StepAction::WriteFile { path, contents } => {
      let path = sub(ctx, path)?;
      let contents = sub(ctx, contents)?;
      ctx.write_file(Path::new(&path), &contents)?;
    }
    StepAction::Inreplace { path, from, to } => {
      let path = sub(ctx, path)?;
      let from = sub(ctx, from)?;
      let to = sub(ctx, to)?;
      ctx.inreplace(Path::new(&path), &from, &to)?;
    }
    StepAction::StageResource { name } => {
      ctx.stage_resource(name).await?;
    }
    StepAction::AssertOutput { command, args, expect } => {
      let command = sub(ctx, command)?;
      let args = sub_all(ctx, args)?;
      let expect = sub(ctx, expect)?;
      let stdout = ctx.capture(&command, &args).await?;
      if !stdout.contains(&expect) {
        return Err(BuildError::UnexpectedOutput {
          command,
          expected: expect,
          actual: stdout,
        });
      }
    }
  }
  Ok(())
}

fn sub(ctx: &BuildContext, text: &str) -> Result<String, BuildError> {
  Ok(substitute(text, ctx)?)
}

fn sub_all(ctx: &BuildContext, items: &[String]) -> Result<Vec<String>, BuildError> {
  items.iter().map(|s| sub(ctx, s)).collect()
}

#[async_trait]
impl InstallProcedure for ScriptedProcedure {
  async fn install(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
    self.run(ctx).await
  }
}

#[async_trait]
impl TestProcedure for ScriptedProcedure {
  async fn test(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
    self.run(ctx).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sandbox::tests::context;
  use std::fs;
  use tempfile::TempDir;

  fn script(json: &str) -> ScriptedProcedure {
    serde_json::from_str(json).unwrap()
  }

  #[test]
  fn steps_deserialize_from_descriptor_json() {
    let procedure = script(
      r#"[
        {"op": "system", "command": "./configure", "args": ["--prefix=$${prefix}"]},
        {"op": "deparallelize"},
        {"op": "system", "command": "make", "args": ["install"], "when": {"with": "bar"}, "cwd": "build"}
      ]"#,
    );
    assert_eq!(procedure.steps.len(), 3);
    assert!(matches!(procedure.steps[1].action, StepAction::Deparallelize));
    assert!(procedure.steps[2].when.is_some());
    assert_eq!(procedure.steps[2].cwd.as_deref(), Some("build"));
  }

  #[tokio::test]
  async fn scripted_install_substitutes_placeholders() {
    let temp = TempDir::new().unwrap();
    let mut ctx = context(&temp, &[]);
    fs::write(ctx.workspace().join("tool.sh"), "#!/bin/sh\necho tool\n").unwrap();

    let procedure = script(
      r##"[
        {"op": "write_file", "path": "$${buildpath}/config.h", "contents": "#define PREFIX \"$${prefix}\"\n"},
        {"op": "inreplace", "path": "config.h", "from": "PREFIX", "to": "INSTALL_PREFIX"},
        {"op": "install", "src": "tool.sh", "dest": "$${bin}", "rename": "tool"},
        {"op": "install", "src": "config.h", "dest": "$${include}/$${name}"}
      ]"##,
    );
    procedure.install(&mut ctx).await.unwrap();

    let header = fs::read_to_string(ctx.paths().include.join("libfoo/config.h")).unwrap();
    assert_eq!(
      header,
      format!("#define INSTALL_PREFIX \"{}\"\n", ctx.paths().prefix.display())
    );
    assert!(ctx.paths().bin.join("tool").is_file());
  }

  #[tokio::test]
  async fn when_predicates_gate_steps() {
    let temp = TempDir::new().unwrap();
    let mut ctx = context(&temp, &["with-bar"]);
    let procedure = script(
      r#"[
        {"op": "write_file", "path": "with-bar", "contents": "", "when": {"with": "bar"}},
        {"op": "write_file", "path": "without-bar", "contents": "", "when": {"without": "bar"}}
      ]"#,
    );
    procedure.install(&mut ctx).await.unwrap();
    assert!(ctx.workspace().join("with-bar").exists());
    assert!(!ctx.workspace().join("without-bar").exists());
  }

  #[tokio::test]
  async fn env_changes_only_affect_later_steps() {
    let temp = TempDir::new().unwrap();
    let mut ctx = context(&temp, &[]);
    let procedure = script(
      r#"[
        {"op": "shell", "script": "echo \"$MAKEFLAGS\" > before"},
        {"op": "deparallelize"},
        {"op": "shell", "script": "echo \"$MAKEFLAGS\" > after"}
      ]"#,
    );
    procedure.install(&mut ctx).await.unwrap();
    assert_eq!(fs::read_to_string(ctx.workspace().join("before")).unwrap(), "-j2\n");
    assert_eq!(fs::read_to_string(ctx.workspace().join("after")).unwrap(), "-j1\n");
  }

  #[tokio::test]
  async fn step_cwd_is_scoped() {
    let temp = TempDir::new().unwrap();
    let mut ctx = context(&temp, &[]);
    fs::create_dir(ctx.workspace().join("build")).unwrap();
    let procedure = script(
      r#"[
        {"op": "shell", "script": "touch inside", "cwd": "build"},
        {"op": "shell", "script": "touch outside"}
      ]"#,
    );
    procedure.install(&mut ctx).await.unwrap();
    assert!(ctx.workspace().join("build/inside").exists());
    assert!(ctx.workspace().join("outside").exists());
  }

  #[tokio::test]
  async fn failing_command_stops_the_script() {
    let temp = TempDir::new().unwrap();
    let mut ctx = context(&temp, &[]);
    let procedure = script(
      r#"[
        {"op": "system", "command": "false"},
        {"op": "write_file", "path": "unreachable", "contents": ""}
      ]"#,
    );
    let err = procedure.install(&mut ctx).await.unwrap_err();
    assert!(matches!(err, BuildError::CommandFailed { code: Some(1), .. }));
    assert!(!ctx.workspace().join("unreachable").exists());
  }

  #[tokio::test]
  async fn assert_output_checks_stdout() {
    let temp = TempDir::new().unwrap();
    let mut ctx = context(&temp, &[]);
    let ok = script(r#"[{"op": "assert_output", "command": "echo", "args": ["hello world"], "expect": "hello"}]"#);
    ok.test(&mut ctx).await.unwrap();

    let bad = script(r#"[{"op": "assert_output", "command": "echo", "args": ["nope"], "expect": "hello"}]"#);
    assert!(matches!(
      bad.test(&mut ctx).await,
      Err(BuildError::UnexpectedOutput { .. })
    ));
  }
}
