//! Implementation of the `bramble pull` command.

use anyhow::{Context, Result};
use serde::Serialize;

use bramble_lib::cache::{self, fetch_from_cache};
use bramble_lib::store::Store;
use bramble_lib::store::lock::LockMode;

use super::runtime;
use crate::output::{OutputFormat, print_json, print_stat, print_success};

#[derive(Serialize)]
struct Pulled {
  filename: String,
  name: String,
  outputs: Vec<String>,
}

/// Fetch derivations by filename from `location` into the local store.
pub fn cmd_pull(location: &str, filenames: &[String], output: OutputFormat) -> Result<()> {
  let store = Store::from_env().context("Failed to open store")?;
  let _lock = store
    .lock(LockMode::Exclusive, "pull")
    .context("Failed to acquire store lock")?;
  let remote = cache::open(location).with_context(|| format!("Failed to open cache {location}"))?;

  let rt = runtime()?;
  let mut pulled = Vec::with_capacity(filenames.len());
  for filename in filenames {
    let drv = rt
      .block_on(fetch_from_cache(&store, remote.as_ref(), filename))
      .with_context(|| format!("Failed to pull {filename} from {location}"))?;
    pulled.push(Pulled {
      filename: drv.filename(),
      name: drv.name.clone(),
      outputs: drv
        .outputs
        .iter()
        .map(|o| store.join(&o.path).display().to_string())
        .collect(),
    });
  }

  if output.is_json() {
    return print_json(&pulled);
  }
  for item in &pulled {
    print_success(&format!("Pulled {}", item.name));
    print_stat("Derivation", &item.filename);
    for path in &item.outputs {
      print_stat("Output", path);
    }
  }
  Ok(())
}
