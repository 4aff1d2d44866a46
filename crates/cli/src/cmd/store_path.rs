use anyhow::{Context, Result};

use bramble_lib::store::Store;

use crate::output::{OutputFormat, print_json, print_stat};

pub fn cmd_store_path(output: OutputFormat) -> Result<()> {
  let store = Store::from_env().context("Failed to open store")?;

  if output.is_json() {
    print_json(&serde_json::json!({
      "bramble_path": store.bramble_path(),
      "store_path": store.store_path(),
    }))?;
  } else {
    print_stat("Bramble path", &store.bramble_path().display().to_string());
    print_stat("Store path", store.store_path_str());
  }
  Ok(())
}
