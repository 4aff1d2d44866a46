//! Implementation of the `bramble push` command.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use bramble_lib::cache::{self, upload_derivations};
use bramble_lib::store::Store;
use bramble_lib::store::lock::LockMode;

use super::{cancel_on_ctrl_c, default_parallelism, read_derivations, runtime};
use crate::output::{OutputFormat, format_duration, print_json, print_stat, print_success};

/// Upload the built derivations in `file`, with their outputs, to `location`.
pub fn cmd_push(location: &str, file: &Path, workers: Option<usize>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let drvs = read_derivations(file)?;
  let store = Store::from_env().context("Failed to open store")?;
  let _lock = store
    .lock(LockMode::Shared, "push")
    .context("Failed to acquire store lock")?;
  let remote = cache::open(location).with_context(|| format!("Failed to open cache {location}"))?;
  let workers = workers.unwrap_or_else(default_parallelism);

  let rt = runtime()?;
  let report = rt
    .block_on(async {
      let cancel = cancel_on_ctrl_c();
      upload_derivations(&store, remote, &drvs, workers, &cancel).await
    })
    .with_context(|| format!("Failed to push to {location}"))?;

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_success(&format!("Pushed to {location}"));
    print_stat("Derivations", &report.derivations.to_string());
    print_stat("Outputs uploaded", &report.outputs_uploaded.to_string());
    print_stat("Outputs already cached", &report.outputs_skipped.to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
  }
  Ok(())
}
