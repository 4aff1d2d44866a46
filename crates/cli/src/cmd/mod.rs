mod build;
mod pull;
mod push;
mod serve;
mod show;
mod store_path;

pub use build::{BuildArgs, SandboxKind, cmd_build};
pub use pull::cmd_pull;
pub use push::cmd_push;
pub use serve::cmd_serve;
pub use show::cmd_show;
pub use store_path::cmd_store_path;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use bramble_lib::derivation::Derivation;

/// A derivations file holds either one derivation or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum DerivationFile {
  Many(Vec<Derivation>),
  One(Box<Derivation>),
}

/// Read and canonicalize the derivations in `path`.
pub(crate) fn read_derivations(path: &Path) -> Result<Vec<Derivation>> {
  let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
  let file: DerivationFile =
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse derivations in {}", path.display()))?;
  let drvs = match file {
    DerivationFile::Many(drvs) => drvs,
    DerivationFile::One(drv) => vec![*drv],
  };
  Ok(drvs.into_iter().map(Derivation::canonicalize).collect())
}

pub(crate) fn default_parallelism() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

/// A token cancelled on Ctrl-C. Must be called inside the runtime.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::warn!("interrupted, cancelling");
      token.cancel();
    }
  });
  cancel
}
