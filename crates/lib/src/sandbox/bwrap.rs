//! Linux isolation through bubblewrap.
//!
//! The builder runs in fresh user, mount, pid, uts and ipc namespaces (and a
//! network namespace unless the derivation asks for network). The root is
//! empty apart from `/proc`, `/dev`, a private `/tmp` and the paths listed in
//! the run options.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::direct::BASE_ENV;
use super::{RunOptions, Sandbox, SandboxError, path_arg, spawn_and_wait};

#[derive(Debug, Clone)]
pub struct BwrapSandbox {
  binary: PathBuf,
  /// Host paths bound read-only into every sandbox, e.g. `/bin` for
  /// builders that rely on host tools.
  host_paths: Vec<PathBuf>,
}

impl BwrapSandbox {
  pub fn new(binary: impl Into<PathBuf>) -> Self {
    Self {
      binary: binary.into(),
      host_paths: Vec::new(),
    }
  }

  pub fn with_host_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
    self.host_paths.extend(paths);
    self
  }

  /// Arguments passed to `bwrap` before the builder command.
  pub fn bwrap_args(&self, opts: &RunOptions) -> Vec<String> {
    let mut args: Vec<String> = [
      "--unshare-all",
      "--die-with-parent",
      "--new-session",
      "--clearenv",
      "--proc",
      "/proc",
      "--dev",
      "/dev",
      "--tmpfs",
      "/tmp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if opts.network {
      args.push("--share-net".to_string());
    }

    for path in &self.host_paths {
      args.extend(["--ro-bind-try".to_string(), path_arg(path), path_arg(path)]);
    }
    for mount in &opts.mounts {
      let flag = if mount.read_only { "--ro-bind" } else { "--bind" };
      args.extend([flag.to_string(), path_arg(&mount.path), path_arg(&mount.path)]);
    }
    for path in &opts.read_only_paths {
      args.extend(["--ro-bind".to_string(), path_arg(path), path_arg(path)]);
    }
    for path in &opts.hidden_paths {
      args.extend(["--tmpfs".to_string(), path_arg(path)]);
    }

    let mut env: Vec<(String, String)> = BASE_ENV.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    env.retain(|(k, _)| !opts.env.contains_key(k));
    env.extend(opts.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in env {
      args.extend(["--setenv".to_string(), key, value]);
    }

    if let Some(dir) = &opts.dir {
      args.extend(["--chdir".to_string(), path_arg(dir)]);
    }
    args.push("--".to_string());
    args
  }
}

#[async_trait]
impl Sandbox for BwrapSandbox {
  async fn run(&self, opts: RunOptions, cancel: &CancellationToken) -> Result<(), SandboxError> {
    opts.program()?;
    let mut cmd = Command::new(&self.binary);
    cmd.args(self.bwrap_args(&opts)).args(&opts.args).env_clear();
    let program = path_arg(&self.binary);
    // bwrap applies --chdir itself; the host side stays where it is
    let opts = RunOptions { dir: None, ..opts };
    spawn_and_wait(cmd, &program, &opts, cancel).await
  }

  fn name(&self) -> &'static str {
    "bwrap"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sandbox::Mount;
  use std::collections::BTreeMap;

  fn windows(args: &[String], n: usize) -> Vec<Vec<&str>> {
    args.windows(n).map(|w| w.iter().map(String::as_str).collect()).collect()
  }

  #[test]
  fn mounts_become_binds() {
    let sbx = BwrapSandbox::new("/usr/bin/bwrap");
    let opts = RunOptions {
      args: vec!["/store/x/bin/sh".to_string()],
      mounts: vec![Mount::read_only("/store"), Mount::read_write("/build")],
      dir: Some(PathBuf::from("/build/src")),
      ..Default::default()
    };
    let args = sbx.bwrap_args(&opts);
    let triples = windows(&args, 3);
    assert!(triples.contains(&vec!["--ro-bind", "/store", "/store"]));
    assert!(triples.contains(&vec!["--bind", "/build", "/build"]));
    assert!(windows(&args, 2).contains(&vec!["--chdir", "/build/src"]));
    assert!(!args.contains(&"--share-net".to_string()));
    assert_eq!(args.last().map(String::as_str), Some("--"));
  }

  #[test]
  fn network_and_env_flags() {
    let sbx = BwrapSandbox::new("bwrap");
    let opts = RunOptions {
      args: vec!["b".to_string()],
      network: true,
      env: BTreeMap::from([("PATH".to_string(), "/store/x/bin".to_string())]),
      hidden_paths: vec![PathBuf::from("/secret")],
      ..Default::default()
    };
    let args = sbx.bwrap_args(&opts);
    assert!(args.contains(&"--share-net".to_string()));
    let triples = windows(&args, 3);
    assert!(triples.contains(&vec!["--setenv", "PATH", "/store/x/bin"]));
    assert!(!triples.contains(&vec!["--setenv", "PATH", "/path-not-set"]));
    assert!(triples.contains(&vec!["--setenv", "HOME", "/homeless-shelter"]));
    assert!(windows(&args, 2).contains(&vec!["--tmpfs", "/secret"]));
  }
}
