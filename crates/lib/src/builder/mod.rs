//! Building derivations.
//!
//! [`Builder::build_derivation`] takes a canonical derivation through:
//!
//! 1. early cutoff: if the store already records outputs for this
//!    derivation and their directories exist, nothing runs
//! 2. a fresh build directory and one temp directory per output, all inside
//!    the store so the final move is a same-filesystem rename
//! 3. the builder: the `basic_fetch_url` builtin or the derivation's own
//!    program in the [`Sandbox`]
//! 4. the normalization pipeline, which hashes each output and moves it
//!    into the store under that hash
//! 5. fetch hash reconciliation against the lockfile, then persisting the
//!    derivation with its outputs
//!
//! Temp directories are removed whatever the outcome. Concurrent calls for
//! the same derivation are serialized, so it is built at most once and the
//! waiting callers see the finished outputs through early cutoff.

mod error;
mod exec;
mod fetch;
mod schedule;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use error::{BuildError, BuildLogs};
pub use schedule::{ScheduleResult, build_derivations};

use crate::consts::{BUILTIN_FETCH_GIT, BUILTIN_FETCH_URL, DEFAULT_OUTPUT};
use crate::derivation::{Derivation, Output, Template};
use crate::lockfile::LockfileWriter;
use crate::normalize::{self, NormalizeError};
use crate::sandbox::Sandbox;
use crate::store::Store;
use crate::util::fs::copy_directory;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  /// Build even if outputs are already in the store.
  pub force_build: bool,
  /// Open an interactive shell in the build environment instead of running
  /// the builder's arguments.
  pub shell: bool,
  /// Stream builder output to the terminal instead of a log file.
  pub verbose: bool,
  /// Build a second time and fail if any output hash differs.
  pub check: bool,
}

pub struct Builder {
  store: Arc<Store>,
  sandbox: Arc<dyn Sandbox>,
  lockfile: Arc<dyn LockfileWriter>,
  client: reqwest::Client,
  in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Builder {
  pub fn new(store: Arc<Store>, sandbox: Arc<dyn Sandbox>, lockfile: Arc<dyn LockfileWriter>) -> Self {
    Self {
      store,
      sandbox,
      lockfile,
      client: reqwest::Client::new(),
      in_flight: Mutex::new(HashMap::new()),
    }
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.store
  }

  /// Build `drv`, returning it with outputs set and whether a build ran.
  pub async fn build_derivation(
    &self,
    drv: Derivation,
    opts: &BuildOptions,
    cancel: &CancellationToken,
  ) -> Result<(Derivation, bool), BuildError> {
    let drv = drv.canonicalize();
    let filename = drv.filename();

    let entry = self.build_lock(&filename);
    let result = {
      let _guard = entry.lock.lock().await;
      self.build_locked(drv, opts, cancel).await
    };
    drop(entry);

    if let Err(e) = &result {
      error!(filename = %filename, error = %e, "build failed");
    }
    result
  }

  async fn build_locked(
    &self,
    mut drv: Derivation,
    opts: &BuildOptions,
    cancel: &CancellationToken,
  ) -> Result<(Derivation, bool), BuildError> {
    let filename = drv.filename();
    let (outputs, exists) = self.store.check_for_built_derivation_outputs(&drv)?;
    if exists && !opts.force_build && self.store.output_folders_exist(&outputs)? {
      debug!(filename = %filename, "outputs already in store");
      drv.outputs = outputs;
      return Ok((drv, false));
    }

    info!(filename = %filename, "building derivation");
    let dependency_paths = self.dependency_paths(&drv)?;

    let workspace = self.run_builder(&drv, opts, cancel).await?;
    let (outputs, moved) = self.hash_and_move(&workspace, &dependency_paths, cancel).await?;
    drv.outputs = outputs;
    drop(workspace);

    if opts.check {
      self.check_reproducible(&drv, opts, &dependency_paths, cancel).await?;
    }

    if let Err(e) = self.check_fetch_hashes(&drv) {
      self.discard_outputs(&moved).await;
      return Err(e);
    }
    self.store.write_derivation(&drv)?;
    info!(filename = %filename, outputs = ?drv.outputs.iter().map(|o| &o.path).collect::<Vec<_>>(), "built derivation");
    Ok((drv, true))
  }

  fn build_lock(&self, filename: &str) -> InFlight<'_> {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    let lock = in_flight.entry(filename.to_string()).or_default().clone();
    InFlight {
      builder: self,
      filename: filename.to_string(),
      lock,
    }
  }

  /// `{store}/{hash}` for every resolved dependency output.
  fn dependency_paths(&self, drv: &Derivation) -> Result<Vec<String>, BuildError> {
    drv
      .dependencies
      .iter()
      .map(|dep| {
        let hash = match &dep.output {
          Some(hash) => hash.clone(),
          None => self
            .store
            .load_derivation(&dep.filename)?
            .and_then(|d| d.output(&dep.output_name).map(|o| o.path.clone()))
            .ok_or_else(|| BuildError::NotFound {
              filename: dep.filename.clone(),
              output_name: dep.output_name.clone(),
            })?,
        };
        Ok(format!("{}/{hash}", self.store.store_path_str()))
      })
      .collect()
  }

  /// Set up a workspace and run the builder in it.
  async fn run_builder(
    &self,
    drv: &Derivation,
    opts: &BuildOptions,
    cancel: &CancellationToken,
  ) -> Result<Workspace, BuildError> {
    let rendered = drv.render(self.store.store_path_str())?;
    let builtin = rendered.builder == BUILTIN_FETCH_URL || rendered.builder == BUILTIN_FETCH_GIT;
    if opts.shell && builtin {
      return Err(BuildError::validation("can't spawn a shell with a builtin builder"));
    }

    let workspace = Workspace::create(&self.store, drv)?;
    if rendered.builder == BUILTIN_FETCH_URL {
      fetch::fetch_url_builder(&self.client, &rendered, &workspace.build_dir, &workspace.outputs, cancel).await?;
    } else {
      let req = exec::ExecRequest {
        drv: &rendered,
        store_path: self.store.store_path(),
        build_dir: &workspace.build_dir,
        outputs: &workspace.outputs,
        opts,
      };
      exec::regular_builder(self.sandbox.as_ref(), req, cancel).await?;
    }
    Ok(workspace)
  }

  async fn hash_and_move(
    &self,
    workspace: &Workspace,
    dependency_paths: &[String],
    cancel: &CancellationToken,
  ) -> Result<(Vec<Output>, Vec<String>), BuildError> {
    let mut outputs = Vec::with_capacity(workspace.outputs.len());
    let mut moved = Vec::new();
    for (name, path) in &workspace.outputs {
      let scan = normalize::hash_and_move_build_output(
        self.store.store_path(),
        path,
        Some(&workspace.build_dir),
        dependency_paths,
        cancel,
      )
      .await
      .map_err(pipeline_error)?;
      debug!(output = %name, hash = %scan.hash, moved = scan.moved, "output hashed");
      if scan.moved {
        moved.push(scan.hash.clone());
      }
      outputs.push(Output {
        path: scan.hash,
        dependencies: scan.dependencies,
      });
    }
    Ok((outputs, moved))
  }

  /// Remove outputs this build put in the store.
  async fn discard_outputs(&self, hashes: &[String]) {
    for hash in hashes {
      let path = self.store.join(hash);
      if let Err(e) = tokio::fs::remove_dir_all(&path).await {
        warn!(path = %path.display(), error = %e, "failed to remove rejected output");
      }
    }
  }

  /// Build again in a fresh workspace and compare hashes. The second set of
  /// outputs is only hashed, never moved into the store.
  async fn check_reproducible(
    &self,
    drv: &Derivation,
    opts: &BuildOptions,
    dependency_paths: &[String],
    cancel: &CancellationToken,
  ) -> Result<(), BuildError> {
    let workspace = self.run_builder(drv, opts, cancel).await?;
    for ((name, path), first) in workspace.outputs.iter().zip(&drv.outputs) {
      let scan = normalize::archive_and_scan_output_directory(
        path,
        &mut tokio::io::sink(),
        Some(&workspace.build_dir),
        self.store.store_path_str(),
        dependency_paths,
      )
      .await
      .map_err(pipeline_error)?;
      if scan.hash != first.path {
        return Err(BuildError::Reproducibility {
          output: name.clone(),
          first: self.store.join(&first.path).display().to_string(),
          second: self.store.join(&scan.hash).display().to_string(),
        });
      }
    }
    debug!(filename = %drv.filename(), "build is reproducible");
    Ok(())
  }

  /// Pin the output of a fetching derivation to a declared hash or the
  /// lockfile, recording it when neither has one.
  fn check_fetch_hashes(&self, drv: &Derivation) -> Result<(), BuildError> {
    let Some(key) = fetch_key(drv) else {
      return Ok(());
    };
    let actual = drv.output(DEFAULT_OUTPUT).map(|o| o.path.clone()).unwrap_or_default();
    let declared = env_text(drv, "hash").filter(|h| !h.is_empty());
    let locked = self.lockfile.lookup_entry(&key);

    if let (Some(declared), Some(locked)) = (&declared, &locked)
      && declared != locked
    {
      return Err(BuildError::FetchHashMismatch {
        key,
        expected: locked.clone(),
        actual: declared.clone(),
      });
    }
    if let Some(expected) = declared.or_else(|| locked.clone())
      && expected != actual
    {
      return Err(BuildError::FetchHashMismatch { key, expected, actual });
    }
    if locked.is_none() {
      debug!(key = %key, hash = %actual, "recording fetch hash");
      self.lockfile.add_entry(&key, &actual)?;
    }
    Ok(())
  }
}

/// A claim on one derivation's build lock. Dropping it, on any exit path,
/// forgets the lock once nobody else is waiting on it.
struct InFlight<'a> {
  builder: &'a Builder,
  filename: String,
  lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    let mut in_flight = self.builder.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    // the map and this claim are the only holders
    if Arc::strong_count(&self.lock) == 2 {
      in_flight.remove(&self.filename);
    }
  }
}

/// Lockfile key for derivations that fetch from the network.
fn fetch_key(drv: &Derivation) -> Option<String> {
  let url = env_text(drv, "url").unwrap_or_default();
  if drv.builder.as_text() == Some(BUILTIN_FETCH_URL) {
    return Some(format!("{BUILTIN_FETCH_URL} {url}"));
  }
  if env_text(drv, "confirm_fetch_url").as_deref() == Some("true") {
    return Some(format!("fetch_url {url}"));
  }
  if env_text(drv, "confirm_fetch_git").as_deref() == Some("true") {
    let mut key = format!("{BUILTIN_FETCH_GIT} {url}");
    if let Some(reference) = env_text(drv, "reference").filter(|r| !r.is_empty()) {
      key.push('@');
      key.push_str(&reference);
    }
    return Some(key);
  }
  None
}

fn env_text(drv: &Derivation, key: &str) -> Option<String> {
  drv.env.get(key).and_then(Template::as_text).map(str::to_string)
}

fn pipeline_error(e: NormalizeError) -> BuildError {
  match e {
    NormalizeError::Cancelled => BuildError::Cancelled,
    e => BuildError::Pipeline(e),
  }
}

/// Build directory and output directories of one build, removed on drop.
struct Workspace {
  build_dir: PathBuf,
  outputs: Vec<(String, PathBuf)>,
}

impl Workspace {
  fn create(store: &Store, drv: &Derivation) -> Result<Self, BuildError> {
    let mut workspace = Self {
      build_dir: store.temp_dir()?,
      outputs: Vec::with_capacity(drv.output_names.len()),
    };
    if let Some(source) = &drv.source {
      copy_directory(&store.join(&source.path), &workspace.build_dir)
        .map_err(|e| BuildError::io("error copying sources into build dir", e))?;
    }
    for name in &drv.output_names {
      workspace.outputs.push((name.clone(), store.temp_dir()?));
    }
    Ok(workspace)
  }
}

impl Drop for Workspace {
  fn drop(&mut self) {
    for dir in std::iter::once(&self.build_dir).chain(self.outputs.iter().map(|(_, p)| p)) {
      if dir.exists() {
        let _ = std::fs::remove_dir_all(dir);
      }
    }
  }
}
