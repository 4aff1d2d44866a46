//! macOS isolation through `sandbox-exec`.

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::direct::BASE_ENV;
use super::{RunOptions, Sandbox, SandboxError, spawn_and_wait};

const BASE_PROFILE: &str = r#"(version 1)
(deny default)
(allow process-exec*)
(import "/System/Library/Sandbox/Profiles/bsd.sb")"#;

#[derive(Debug, Clone, Default)]
pub struct SandboxExec;

impl SandboxExec {
  pub fn new() -> Self {
    Self
  }

  pub fn profile(network: bool) -> String {
    let mut profile = BASE_PROFILE.to_string();
    if network {
      profile.push_str("\n(allow network*)");
    }
    profile
  }
}

#[async_trait]
impl Sandbox for SandboxExec {
  async fn run(&self, opts: RunOptions, cancel: &CancellationToken) -> Result<(), SandboxError> {
    let program = opts.program()?.to_string();
    let mut cmd = Command::new("sandbox-exec");
    cmd
      .arg("-p")
      .arg(Self::profile(opts.network))
      .args(&opts.args)
      .env_clear();
    for (key, value) in BASE_ENV {
      cmd.env(key, value);
    }
    cmd.envs(&opts.env);
    spawn_and_wait(cmd, &program, &opts, cancel).await
  }

  fn name(&self) -> &'static str {
    "sandbox-exec"
  }
}
