//! Moving built derivations between a store and a remote cache.
//!
//! Outputs leave the store with every reference to a dependency (and to
//! the output itself) rewritten from the local store path to the prefix of
//! record, the same rewrite the content hash was computed under. On the
//! way back in those same references are swapped for the receiving store's
//! path and the output is re-verified against its hash before it is moved
//! into place.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{CacheError, CacheKey, CacheReader, RemoteCache};
use crate::consts::BRAMBLE_PREFIX_OF_RECORD;
use crate::derivation::Derivation;
use crate::normalize::{self, NormalizeError};
use crate::store::Store;
use crate::util::hash::is_store_hash;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
  /// Derivations written to the cache.
  pub derivations: usize,
  pub outputs_uploaded: usize,
  /// Outputs the cache already had.
  pub outputs_skipped: usize,
}

/// Upload `drvs` and their outputs to `cache`.
///
/// Each derivation must be built. Outputs go first, at most `workers` at a
/// time, so a derivation is only visible in the cache once its outputs are.
/// Objects the cache already has are skipped.
#[instrument(skip_all, fields(cache = %cache.location(), derivations = drvs.len()))]
pub async fn upload_derivations(
  store: &Store,
  cache: Arc<dyn RemoteCache>,
  drvs: &[Derivation],
  workers: usize,
  cancel: &CancellationToken,
) -> Result<UploadReport, CacheError> {
  let store_path = store.store_path_str().to_string();
  let semaphore = Arc::new(Semaphore::new(workers.max(1)));
  let mut report = UploadReport::default();
  let mut seen = HashSet::new();
  let mut built = Vec::with_capacity(drvs.len());
  let mut set = JoinSet::new();

  for drv in drvs {
    let drv = built_derivation(store, drv)?;
    for output in &drv.outputs {
      if !seen.insert(output.path.clone()) {
        continue;
      }
      let key = CacheKey::output(&output.path);
      if cache.exists(&key).await? {
        debug!(output = %output.path, "output already in cache");
        report.outputs_skipped += 1;
        continue;
      }

      let dependency_paths = output
        .dependencies
        .iter()
        .map(|dep| format!("{store_path}/{dep}"))
        .collect();
      let cache = cache.clone();
      let semaphore = semaphore.clone();
      let dir = store.join(&output.path);
      let store_path = store_path.clone();
      set.spawn(async move {
        let _permit = semaphore
          .acquire_owned()
          .await
          .map_err(|_| CacheError::Cancelled)?;
        upload_output(cache, key, dir, store_path, dependency_paths).await
      });
    }
    built.push(drv);
  }

  loop {
    let joined = tokio::select! {
      joined = set.join_next() => joined,
      _ = cancel.cancelled() => {
        set.abort_all();
        return Err(CacheError::Cancelled);
      }
    };
    let Some(joined) = joined else { break };
    match joined {
      Ok(Ok(key)) => {
        info!(key = %key, "uploaded output");
        report.outputs_uploaded += 1;
      }
      Ok(Err(e)) => return Err(e),
      Err(e) => return Err(CacheError::io("upload task failed", std::io::Error::other(e))),
    }
  }

  for drv in &built {
    let normalized = drv.normalized(&store_path).canonicalize();
    let key = CacheKey::derivation(normalized.filename());
    if cache.exists(&key).await? {
      continue;
    }
    cache.put(&key, Box::new(Cursor::new(normalized.to_json()))).await?;
    debug!(key = %key, "uploaded derivation");
    report.derivations += 1;
  }

  info!(
    derivations = report.derivations,
    uploaded = report.outputs_uploaded,
    skipped = report.outputs_skipped,
    "upload complete"
  );
  Ok(report)
}

/// `drv` with its outputs, which must all be present in the store.
fn built_derivation(store: &Store, drv: &Derivation) -> Result<Derivation, CacheError> {
  let filename = drv.filename();
  let drv = if drv.missing_output() {
    store
      .load_derivation(&filename)?
      .filter(|d| !d.missing_output())
      .ok_or_else(|| CacheError::NotBuilt(filename.clone()))?
  } else {
    drv.clone()
  };
  if !store.output_folders_exist(&drv.outputs)? {
    return Err(CacheError::NotBuilt(filename));
  }
  Ok(drv)
}

async fn upload_output(
  cache: Arc<dyn RemoteCache>,
  key: CacheKey,
  dir: PathBuf,
  store_path: String,
  mut values: Vec<String>,
) -> Result<CacheKey, CacheError> {
  values.push(format!("{store_path}/{}", key.name()));

  let (archive_w, mut archive_r) = tokio::io::duplex(PIPE_CAPACITY);
  let (mut rewritten_w, rewritten_r) = tokio::io::duplex(PIPE_CAPACITY);

  let archiving = async { normalize::archive_to(dir, archive_w).await.map_err(CacheError::from) };
  let rewriting = async move {
    normalize::replace_strings_prefix(
      &mut archive_r,
      &mut rewritten_w,
      &values,
      &store_path,
      BRAMBLE_PREFIX_OF_RECORD,
    )
    .await?;
    rewritten_w
      .shutdown()
      .await
      .map_err(|e| CacheError::io("closing upload stream", e))
  };
  let putting = cache.put(&key, Box::new(rewritten_r));

  tokio::try_join!(archiving, rewriting, putting)?;
  Ok(key)
}

/// Fetch the derivation `filename` and its outputs from `cache` into
/// `store`, returning the derivation as written locally.
///
/// Outputs already in the store are not downloaded again; a derivation
/// that is fully present locally is returned without touching the cache.
#[instrument(skip(store, cache), fields(cache = %cache.location()))]
pub async fn fetch_from_cache(store: &Store, cache: &dyn RemoteCache, filename: &str) -> Result<Derivation, CacheError> {
  if let Some(local) = store.load_derivation(filename)?
    && !local.missing_output()
    && store.output_folders_exist(&local.outputs)?
  {
    debug!("derivation already present");
    return Ok(local);
  }

  let mut reader = cache.get(&CacheKey::derivation(filename)).await?;
  let mut json = Vec::new();
  reader
    .read_to_end(&mut json)
    .await
    .map_err(|e| CacheError::io(format!("reading derivation {filename}"), e))?;
  let drv: Derivation = serde_json::from_slice(&json).map_err(|source| CacheError::Decode {
    filename: filename.to_string(),
    source,
  })?;
  let drv = drv.canonicalize();
  if drv.missing_output() {
    return Err(CacheError::NotBuilt(filename.to_string()));
  }

  let store_path = store.store_path_str();
  for output in &drv.outputs {
    if store.has_output(&output.path) {
      continue;
    }
    let body = cache.get(&CacheKey::output(&output.path)).await?;
    receive_output(store, &output.path, body, Relocate::FromPrefix, &output.dependencies).await?;
    info!(output = %output.path, "downloaded output");
  }

  let local = drv.localized(store_path, |hash| store.has_output(hash));
  store.write_derivation(&local)?;
  Ok(local)
}

/// How references inside a received archive are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Relocate {
  /// Already in this store's own paths.
  Keep,
  /// Self and dependency references use the prefix of record and are
  /// moved to this store's path on the way in.
  FromPrefix,
}

/// Unpack an output archive into the store as `hash`.
///
/// With [`Relocate::FromPrefix`] only `{prefix}/{hash}` and
/// `{prefix}/{dep}` for each of `dependencies` are swapped for local store
/// paths; any other use of the prefix, such as a scrubbed build directory,
/// is part of the hashed content and stays. The unpacked output must verify
/// against `hash` before it is moved into place. Returns false if `hash`
/// was already present.
pub(crate) async fn receive_output(
  store: &Store,
  hash: &str,
  body: CacheReader,
  relocate: Relocate,
  dependencies: &[String],
) -> Result<bool, CacheError> {
  if !is_store_hash(hash) {
    return Err(CacheError::InvalidKey(CacheKey::output(hash).to_string()));
  }
  if store.has_output(hash) {
    return Ok(false);
  }

  let store_path = store.store_path_str();
  let scratch = Scratch::new(store.temp_dir()?);
  let location = scratch.path().to_path_buf();
  match relocate {
    Relocate::FromPrefix => {
      let values: Vec<String> = std::iter::once(hash)
        .chain(dependencies.iter().map(String::as_str))
        .map(|h| format!("{BRAMBLE_PREFIX_OF_RECORD}/{h}"))
        .collect();
      let (mut swapped_w, swapped_r) = tokio::io::duplex(PIPE_CAPACITY);
      let mut body = body;
      let swapping = async move {
        normalize::replace_strings_prefix(&mut body, &mut swapped_w, &values, BRAMBLE_PREFIX_OF_RECORD, store_path)
          .await?;
        swapped_w
          .shutdown()
          .await
          .map_err(|e| NormalizeError::io("closing download stream", e))
      };
      tokio::try_join!(swapping, normalize::unarchive_from(swapped_r, location.clone()))?;
    }
    Relocate::Keep => normalize::unarchive_from(body, location.clone()).await?,
  }

  let dependency_paths: Vec<String> = dependencies.iter().map(|dep| format!("{store_path}/{dep}")).collect();
  normalize::hash_normalized_build_output(&location, hash, store_path, &dependency_paths).await?;
  scratch.persist(&store.join(hash)).await
}

/// A temp directory removed on drop unless persisted.
struct Scratch {
  path: PathBuf,
  keep: bool,
}

impl Scratch {
  fn new(path: PathBuf) -> Self {
    Self { path, keep: false }
  }

  fn path(&self) -> &Path {
    &self.path
  }

  /// Rename into `dst`. Returns false, discarding the scratch copy, if
  /// `dst` already exists.
  async fn persist(mut self, dst: &Path) -> Result<bool, CacheError> {
    if tokio::fs::try_exists(dst).await.unwrap_or(false) {
      return Ok(false);
    }
    match tokio::fs::rename(&self.path, dst).await {
      Ok(()) => {
        self.keep = true;
        Ok(true)
      }
      Err(_) if dst.is_dir() => Ok(false),
      Err(e) => Err(CacheError::io(format!("moving output into {}", dst.display()), e)),
    }
  }
}

impl Drop for Scratch {
  fn drop(&mut self) {
    if !self.keep {
      let _ = std::fs::remove_dir_all(&self.path);
    }
  }
}
