//! Sub-process execution for build and test procedures.
//!
//! Every command runs with a cleared environment: the child sees exactly the
//! variables of the [`BuildEnv`] it was given and nothing else.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use super::BuildError;
use super::env::BuildEnv;

/// Output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
  pub code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.code == Some(0)
  }

  /// Stdout followed by stderr, trimmed to the last `limit` bytes.
  pub fn combined_tail(&self, limit: usize) -> String {
    let combined = format!("{}{}", self.stdout, self.stderr);
    if combined.len() <= limit {
      return combined;
    }
    let mut start = combined.len() - limit;
    while !combined.is_char_boundary(start) {
      start += 1;
    }
    combined[start..].to_string()
  }
}

/// Display form of a command line, for logs and errors.
pub fn display_command(program: &str, args: &[String]) -> String {
  std::iter::once(program)
    .chain(args.iter().map(String::as_str))
    .collect::<Vec<_>>()
    .join(" ")
}

/// Run `program` with `args` in `cwd` under `env`, killing it after `timeout`.
///
/// The child's exit status is returned as-is; callers decide whether a
/// non-zero code is an error.
pub async fn run(
  program: &str,
  args: &[String],
  cwd: &Path,
  env: &BuildEnv,
  timeout: Duration,
) -> Result<CommandOutput, BuildError> {
  let command_line = display_command(program, args);
  info!(cmd = %command_line, cwd = %cwd.display(), "running command");

  for key in ["HOME", "TMPDIR"] {
    if let Some(dir) = env.get(key) {
      tokio::fs::create_dir_all(dir).await?;
    }
  }

  let mut command = Command::new(program);
  command
    .args(args)
    .current_dir(cwd)
    .env_clear()
    .envs(env.vars())
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let output = match tokio::time::timeout(timeout, command.output()).await {
    Ok(result) => result.map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound => BuildError::CommandFailed {
        command: command_line.clone(),
        code: None,
        output: format!("{}: command not found", program),
      },
      _ => BuildError::Io(e),
    })?,
    Err(_) => {
      return Err(BuildError::Timeout {
        command: command_line,
        timeout,
      });
    }
  };

  let result = CommandOutput {
    code: output.status.code(),
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
  };

  if !result.stderr.is_empty() {
    debug!(stderr = %result.stderr, "command stderr");
  }
  if !result.stdout.is_empty() {
    debug!(stdout = %result.stdout, "command stdout");
  }

  Ok(result)
}

/// Run a script through `/bin/sh -c`.
pub async fn run_shell(
  script: &str,
  cwd: &Path,
  env: &BuildEnv,
  timeout: Duration,
) -> Result<CommandOutput, BuildError> {
  run("/bin/sh", &["-c".to_string(), script.to_string()], cwd, env, timeout).await
}
