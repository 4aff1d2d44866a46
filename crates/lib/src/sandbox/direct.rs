//! Unisolated runner.
//!
//! Runs the builder as an ordinary child process. Nothing is mounted or
//! hidden; only the environment is controlled:
//! - every inherited variable is cleared
//! - `PATH` is `/path-not-set` so undeclared tools fail fast
//! - `HOME` is `/homeless-shelter`
//! - `SOURCE_DATE_EPOCH` is 315532800 (1980-01-01) for reproducible timestamps
//!
//! Variables supplied in [`RunOptions::env`] override all of the above.

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{RunOptions, Sandbox, SandboxError, spawn_and_wait};

pub(crate) const BASE_ENV: &[(&str, &str)] = &[
  ("PATH", "/path-not-set"),
  ("HOME", "/homeless-shelter"),
  ("LANG", "C"),
  ("LC_ALL", "C"),
  ("SOURCE_DATE_EPOCH", "315532800"),
];

#[derive(Debug, Clone, Default)]
pub struct DirectRunner;

impl DirectRunner {
  pub fn new() -> Self {
    Self
  }
}

#[async_trait]
impl Sandbox for DirectRunner {
  async fn run(&self, opts: RunOptions, cancel: &CancellationToken) -> Result<(), SandboxError> {
    let program = opts.program()?.to_string();
    let mut cmd = Command::new(&program);
    cmd.args(&opts.args[1..]).env_clear();
    for (key, value) in BASE_ENV {
      cmd.env(key, value);
    }
    if let Some(dir) = &opts.dir {
      for key in ["TMPDIR", "TMP", "TEMP", "TEMPDIR"] {
        cmd.env(key, dir);
      }
    }
    cmd.envs(&opts.env);
    spawn_and_wait(cmd, &program, &opts, cancel).await
  }

  fn name(&self) -> &'static str {
    "direct"
  }
}
