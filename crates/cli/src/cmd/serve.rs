//! Implementation of the `bramble serve` command.

use std::sync::Arc;

use anyhow::{Context, Result};

use bramble_lib::cache::server;
use bramble_lib::store::Store;

use super::{cancel_on_ctrl_c, runtime};
use crate::output::print_info;

/// Serve the local store as a cache until interrupted.
pub fn cmd_serve(listen: &str) -> Result<()> {
  let store = Arc::new(Store::from_env().context("Failed to open store")?);
  let rt = runtime()?;
  rt.block_on(async {
    let listener = tokio::net::TcpListener::bind(listen)
      .await
      .with_context(|| format!("Failed to listen on {listen}"))?;
    let addr = listener.local_addr().context("Failed to read listen address")?;
    print_info(&format!("Serving {} on http://{addr}", store.store_path().display()));
    let cancel = cancel_on_ctrl_c();
    server::serve(store, listener, cancel).await.context("Cache server failed")
  })
}
