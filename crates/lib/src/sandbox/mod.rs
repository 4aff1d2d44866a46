//! Running builders in isolation.
//!
//! The [`Sandbox`] trait is the seam between the builder and the host: the
//! builder describes what to run and which paths must be visible, and a
//! platform backend decides how to enforce it.
//!
//! - [`DirectRunner`]: plain child process with a scrubbed environment
//! - `BwrapSandbox` (Linux): bubblewrap namespaces with explicit bind mounts
//! - `SandboxExec` (macOS): `sandbox-exec` with a deny-by-default profile

mod direct;

#[cfg(target_os = "linux")]
mod bwrap;
#[cfg(target_os = "macos")]
mod darwin;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use direct::DirectRunner;

#[cfg(target_os = "linux")]
pub use bwrap::BwrapSandbox;
#[cfg(target_os = "macos")]
pub use darwin::SandboxExec;

#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("no program to run")]
  NoProgram,

  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("process exited with {}", exit_description(.code))]
  Exited { code: Option<i32> },

  #[error("process was cancelled")]
  Cancelled,

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

fn exit_description(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("code {code}"),
    None => "a signal".to_string(),
  }
}

/// A path made visible inside the sandbox. Parsed from `path` or `path:ro`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
  pub path: PathBuf,
  pub read_only: bool,
}

impl Mount {
  pub fn read_write(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      read_only: false,
    }
  }

  pub fn read_only(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      read_only: true,
    }
  }

  pub fn parse(spec: &str) -> Self {
    match spec.strip_suffix(":ro") {
      Some(path) => Self::read_only(path),
      None => Self::read_write(spec),
    }
  }
}

impl fmt::Display for Mount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.path.display())?;
    if self.read_only {
      write!(f, ":ro")?;
    }
    Ok(())
  }
}

/// Where a standard stream of the sandboxed process goes.
#[derive(Debug, Default)]
pub enum StdStream {
  #[default]
  Inherit,
  Null,
  File(std::fs::File),
}

impl StdStream {
  fn to_stdio(&self) -> io::Result<Stdio> {
    Ok(match self {
      StdStream::Inherit => Stdio::inherit(),
      StdStream::Null => Stdio::null(),
      StdStream::File(file) => Stdio::from(file.try_clone()?),
    })
  }
}

/// What to run and what it may see.
#[derive(Debug, Default)]
pub struct RunOptions {
  /// Program followed by its arguments.
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub dir: Option<PathBuf>,
  pub mounts: Vec<Mount>,
  pub network: bool,
  pub stdin: StdStream,
  pub stdout: StdStream,
  pub stderr: StdStream,
  /// Paths masked with an empty directory.
  pub hidden_paths: Vec<PathBuf>,
  /// Paths exposed read-only in addition to `mounts`.
  pub read_only_paths: Vec<PathBuf>,
  /// Attached to the terminal. Anything else runs in its own process group
  /// so cancellation reaches every process it started.
  pub interactive: bool,
}

impl RunOptions {
  pub fn program(&self) -> Result<&str, SandboxError> {
    self.args.first().map(String::as_str).ok_or(SandboxError::NoProgram)
  }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
  /// Run to completion. A non-zero exit is [`SandboxError::Exited`].
  async fn run(&self, opts: RunOptions, cancel: &CancellationToken) -> Result<(), SandboxError>;

  fn name(&self) -> &'static str;
}

/// The strongest backend available on this host.
#[cfg(target_os = "linux")]
pub fn default_sandbox() -> Arc<dyn Sandbox> {
  if let Some(bwrap) = find_in_path("bwrap") {
    return Arc::new(BwrapSandbox::new(bwrap));
  }
  tracing::warn!("bwrap not found; builds will run without isolation");
  Arc::new(DirectRunner::new())
}

#[cfg(target_os = "macos")]
pub fn default_sandbox() -> Arc<dyn Sandbox> {
  Arc::new(SandboxExec::new())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn default_sandbox() -> Arc<dyn Sandbox> {
  Arc::new(DirectRunner::new())
}

#[cfg(target_os = "linux")]
fn find_in_path(name: &str) -> Option<PathBuf> {
  let path = std::env::var_os("PATH")?;
  std::env::split_paths(&path)
    .map(|dir| dir.join(name))
    .find(|candidate| candidate.is_file())
}

/// Wire up stdio, spawn and wait, killing the child on cancellation.
pub(crate) async fn spawn_and_wait(
  mut cmd: Command,
  program: &str,
  opts: &RunOptions,
  cancel: &CancellationToken,
) -> Result<(), SandboxError> {
  cmd
    .stdin(opts.stdin.to_stdio()?)
    .stdout(opts.stdout.to_stdio()?)
    .stderr(opts.stderr.to_stdio()?)
    .kill_on_drop(true);
  if let Some(dir) = &opts.dir {
    cmd.current_dir(dir);
  }
  // an interactive child stays in the terminal's foreground group
  let grouped = !opts.interactive;
  if grouped {
    own_process_group(&mut cmd);
  }

  debug!(program = %program, dir = ?opts.dir, "spawning process");
  let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
    program: program.to_string(),
    source,
  })?;

  tokio::select! {
    status = child.wait() => {
      let status = status?;
      if status.success() {
        Ok(())
      } else {
        Err(SandboxError::Exited { code: status.code() })
      }
    }
    _ = cancel.cancelled() => {
      if grouped {
        kill_process_group(&child);
      }
      let _ = child.kill().await;
      Err(SandboxError::Cancelled)
    }
  }
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
  cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Kill everything the child started, not just the child.
#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
  use rustix::process::{Pid, Signal, kill_process_group};

  let Some(id) = child.id() else {
    return;
  };
  if let Some(pid) = Pid::from_raw(id as i32)
    && let Err(e) = kill_process_group(pid, Signal::KILL)
  {
    debug!(pid = id, error = %e, "failed to kill process group");
  }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

#[cfg(target_os = "linux")]
pub(crate) fn path_arg(path: &std::path::Path) -> String {
  path.to_string_lossy().into_owned()
}
