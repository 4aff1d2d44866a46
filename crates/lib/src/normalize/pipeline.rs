//! The streaming normalization pipeline.
//!
//! ```text
//! archive ─▶ scrub build dir ─▶ fork ─┬─▶ tar temp file ─▶ (materialize)
//!                                     └─▶ rewrite store refs ─▶ null self name ─▶ hash
//! ```
//!
//! Stages are connected with in-memory pipes and run concurrently. The
//! first stage to fail decides the error; every other stage is dropped,
//! which closes its pipe ends and unblocks whatever was on the other side.
//!
//! The hash branch rewrites references to the local store into
//! [`BRAMBLE_PREFIX_OF_RECORD`], so the content hash doesn't depend on where
//! bramble is installed. The materialized copy keeps local paths so the
//! output stays runnable in place.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::archive::{archive_to, unarchive_from};
use super::textreplace::{replace_bytes, replace_strings_prefix};
use super::NormalizeError;
use crate::consts::{BRAMBLE_PREFIX_OF_RECORD, HASH_LEN};
use crate::store::tempfiles::{store_length_temp_dir, store_length_temp_file};
use crate::util::hash::Hasher;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Outcome of scanning one output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
  /// Content hash of the normalized archive.
  pub hash: String,
  /// Hashes of the known dependency outputs referenced by the output.
  pub dependencies: Vec<String>,
  /// Whether this call put the output into the store. False when only
  /// scanning, or when an identical output was already there.
  pub moved: bool,
}

/// Async sink feeding a [`Hasher`].
#[derive(Default)]
pub struct HashWriter {
  hasher: Hasher,
}

impl HashWriter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn finish(self) -> String {
    self.hasher.finish()
  }
}

impl AsyncWrite for HashWriter {
  fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
    self.get_mut().hasher.update(buf);
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }
}

fn pipe() -> (DuplexStream, DuplexStream) {
  tokio::io::duplex(PIPE_CAPACITY)
}

fn folder_name(dir: &Path) -> Result<String, NormalizeError> {
  dir
    .file_name()
    .and_then(|n| n.to_str())
    .map(str::to_string)
    .ok_or_else(|| {
      NormalizeError::io(
        format!("output directory {} has no usable name", dir.display()),
        std::io::ErrorKind::InvalidInput.into(),
      )
    })
}

/// The same-length stand-in for a build directory path: the random tail
/// becomes `x`s and a store prefix becomes the prefix of record.
fn scrubbed_build_dir(build_dir: &str, store_path: &str) -> String {
  let bytes = build_dir.as_bytes();
  let keep = bytes.len().saturating_sub(HASH_LEN);
  let head = String::from_utf8_lossy(&bytes[..keep]).into_owned();
  let head = match head.strip_prefix(store_path) {
    Some(rest) if store_path.len() == BRAMBLE_PREFIX_OF_RECORD.len() => format!("{BRAMBLE_PREFIX_OF_RECORD}{rest}"),
    _ => head,
  };
  let scrubbed = format!("{head}{}", "x".repeat(bytes.len() - keep));
  if scrubbed.len() == bytes.len() {
    scrubbed
  } else {
    "x".repeat(bytes.len())
  }
}

/// Copy `src` to both writers.
async fn fork<R, A, B>(src: &mut R, a: &mut A, b: &mut B) -> Result<(), NormalizeError>
where
  R: AsyncRead + Unpin,
  A: AsyncWrite + Unpin + ?Sized,
  B: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; PIPE_CAPACITY];
  loop {
    let n = src
      .read(&mut buf)
      .await
      .map_err(|e| NormalizeError::io("reading archive", e))?;
    if n == 0 {
      break;
    }
    a.write_all(&buf[..n])
      .await
      .map_err(|e| NormalizeError::io("writing archive copy", e))?;
    b.write_all(&buf[..n])
      .await
      .map_err(|e| NormalizeError::io("writing hash stream", e))?;
  }
  a.flush().await.map_err(|e| NormalizeError::io("flushing archive copy", e))?;
  b.shutdown().await.map_err(|e| NormalizeError::io("closing hash stream", e))?;
  Ok(())
}

/// Archive `output_dir`, writing the build-dir-scrubbed tar to `tar_out`
/// and returning the content hash and the dependencies found.
///
/// `dependency_paths` are the local paths (`{store_path}/{hash}`) of every
/// output the build could have referenced.
#[instrument(skip_all, fields(output = %output_dir.display()))]
pub async fn archive_and_scan_output_directory<W>(
  output_dir: &Path,
  tar_out: &mut W,
  build_dir: Option<&Path>,
  store_path: &str,
  dependency_paths: &[String],
) -> Result<ScanResult, NormalizeError>
where
  W: AsyncWrite + Unpin + Send + ?Sized,
{
  let self_name = folder_name(output_dir)?;
  let self_path = format!("{store_path}/{self_name}");

  let build_dir_swap = match build_dir {
    Some(dir) => {
      let old = dir.to_string_lossy().into_owned();
      let new = scrubbed_build_dir(&old, store_path);
      Some((old.into_bytes(), new.into_bytes()))
    }
    None => None,
  };

  let mut rewrite_values: Vec<String> = dependency_paths.to_vec();
  rewrite_values.push(self_path.clone());
  rewrite_values.sort();
  rewrite_values.dedup();

  let (archive_w, mut archive_r) = pipe();
  let (mut scrubbed_w, mut scrubbed_r) = pipe();
  let (mut hash_w, mut hash_r) = pipe();
  let (mut rewritten_w, mut rewritten_r) = pipe();

  let archiving = archive_to(output_dir.to_path_buf(), archive_w);

  let scrubbing = async move {
    match &build_dir_swap {
      Some((old, new)) => {
        replace_bytes(&mut archive_r, &mut scrubbed_w, old, new).await?;
      }
      None => {
        tokio::io::copy(&mut archive_r, &mut scrubbed_w)
          .await
          .map_err(|e| NormalizeError::io("copying archive", e))?;
      }
    }
    scrubbed_w
      .shutdown()
      .await
      .map_err(|e| NormalizeError::io("closing archive stream", e))
  };

  let forking = async move { fork(&mut scrubbed_r, tar_out, &mut hash_w).await };

  let rewriting = async move {
    let matches =
      replace_strings_prefix(&mut hash_r, &mut rewritten_w, &rewrite_values, store_path, BRAMBLE_PREFIX_OF_RECORD)
        .await?;
    rewritten_w
      .shutdown()
      .await
      .map_err(|e| NormalizeError::io("closing rewritten stream", e))?;
    Ok::<_, NormalizeError>(matches)
  };

  let hashing = async move {
    let mut hasher = HashWriter::new();
    let zeros = vec![0u8; self_name.len()];
    replace_bytes(&mut rewritten_r, &mut hasher, self_name.as_bytes(), &zeros).await?;
    Ok::<_, NormalizeError>(hasher.finish())
  };

  let ((), (), (), matches, hash) = tokio::try_join!(archiving, scrubbing, forking, rewriting, hashing)?;

  let prefix = format!("{store_path}/");
  let dependencies = matches
    .into_iter()
    .filter(|m| *m != self_path)
    .filter_map(|m| m.strip_prefix(&prefix).map(str::to_string))
    .collect();

  Ok(ScanResult {
    hash,
    dependencies,
    moved: false,
  })
}

/// Normalize the build output in `output_dir` and move it into the store
/// under its content hash.
///
/// If an output with the same hash is already present the new copy is
/// discarded. Cancellation is honored up to the point the output is moved.
#[instrument(skip_all, fields(output = %output_dir.display()))]
pub async fn hash_and_move_build_output(
  store_dir: &Path,
  output_dir: &Path,
  build_dir: Option<&Path>,
  dependency_paths: &[String],
  cancel: &CancellationToken,
) -> Result<ScanResult, NormalizeError> {
  let store_path = store_dir.to_str().ok_or_else(|| {
    NormalizeError::io(
      format!("store path {} is not valid UTF-8", store_dir.display()),
      std::io::ErrorKind::InvalidInput.into(),
    )
  })?;
  let self_name = folder_name(output_dir)?;

  let (file, tar_path) =
    store_length_temp_file(store_dir).map_err(|e| NormalizeError::io("creating archive temp file", e))?;
  let _cleanup = RemoveOnDrop(tar_path.clone());

  let mut tar_file = tokio::fs::File::from_std(file);
  let mut scan =
    archive_and_scan_output_directory(output_dir, &mut tar_file, build_dir, store_path, dependency_paths).await?;
  tar_file
    .sync_all()
    .await
    .map_err(|e| NormalizeError::io("syncing archive temp file", e))?;
  drop(tar_file);

  if let Err(e) = tokio::fs::remove_dir_all(output_dir).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    return Err(NormalizeError::io(format!("removing {}", output_dir.display()), e));
  }

  if cancel.is_cancelled() {
    return Err(NormalizeError::Cancelled);
  }

  if store_dir.join(&scan.hash).exists() {
    debug!(hash = %scan.hash, "output already in store");
  } else {
    unarchive_and_replace_output_folder_name(&tar_path, store_dir, &self_name, &scan.hash).await?;
    scan.moved = true;
  }
  Ok(scan)
}

/// Unpack the archive at `tar_path` into `{store_dir}/{hash}`, replacing
/// every occurrence of the temp folder name with the hash on the way.
///
/// The archive is unpacked into a scratch directory first and then renamed,
/// so the store never holds a partial output.
pub async fn unarchive_and_replace_output_folder_name(
  tar_path: &Path,
  store_dir: &Path,
  folder_name: &str,
  hash: &str,
) -> Result<(), NormalizeError> {
  let dst = store_dir.join(hash);
  let scratch = store_length_temp_dir(store_dir).map_err(|e| NormalizeError::io("creating unpack directory", e))?;

  let result = async {
    let mut src = tokio::fs::File::open(tar_path)
      .await
      .map_err(|e| NormalizeError::io(format!("opening {}", tar_path.display()), e))?;
    let (mut w, r) = pipe();
    let replacing = async move {
      replace_bytes(&mut src, &mut w, folder_name.as_bytes(), hash.as_bytes()).await?;
      w.shutdown()
        .await
        .map_err(|e| NormalizeError::io("closing archive stream", e))
    };
    let unpacking = unarchive_from(r, scratch.clone());
    tokio::try_join!(replacing, unpacking)?;

    match tokio::fs::rename(&scratch, &dst).await {
      Ok(()) => Ok(()),
      // lost a race against an identical output
      Err(_) if dst.exists() => Ok(()),
      Err(e) => Err(NormalizeError::io(format!("moving output to {}", dst.display()), e)),
    }
  }
  .await;

  if scratch.exists() {
    let _ = tokio::fs::remove_dir_all(&scratch).await;
  }
  result
}

/// Recompute the hash of an output already in normalized form at
/// `location` and compare it with `hash`.
///
/// `store_path` and `dependency_paths` describe local references that
/// should be rewritten first; for content that is already normalized pass
/// an empty slice of dependencies.
pub async fn hash_normalized_build_output(
  location: &Path,
  hash: &str,
  store_path: &str,
  dependency_paths: &[String],
) -> Result<(), NormalizeError> {
  let mut values: Vec<String> = dependency_paths.to_vec();
  values.push(format!("{store_path}/{hash}"));

  let (archive_w, mut archive_r) = pipe();
  let (mut rewritten_w, mut rewritten_r) = pipe();

  let archiving = archive_to(location.to_path_buf(), archive_w);
  let rewriting = async move {
    replace_strings_prefix(&mut archive_r, &mut rewritten_w, &values, store_path, BRAMBLE_PREFIX_OF_RECORD).await?;
    rewritten_w
      .shutdown()
      .await
      .map_err(|e| NormalizeError::io("closing rewritten stream", e))
  };
  let hashing = async move {
    let mut hasher = HashWriter::new();
    let zeros = vec![0u8; hash.len()];
    replace_bytes(&mut rewritten_r, &mut hasher, hash.as_bytes(), &zeros).await?;
    Ok::<_, NormalizeError>(hasher.finish())
  };

  let ((), (), actual) = tokio::try_join!(archiving, rewriting, hashing)?;
  if actual != hash {
    return Err(NormalizeError::HashMismatch {
      expected: hash.to_string(),
      actual,
    });
  }
  Ok(())
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use std::time::Duration;
  use crate::util::testutil::padded_store;
  use tempfile::TempDir;

  /// Two padded store directories under different roots.
  fn two_stores() -> (TempDir, TempDir, PathBuf, PathBuf) {
    let (ra, a) = padded_store();
    let (rb, b) = padded_store();
    (ra, rb, a, b)
  }

  fn s(p: &Path) -> &str {
    p.to_str().unwrap()
  }

  async fn scan(output_dir: &Path, store: &Path, build_dir: Option<&Path>, deps: &[String]) -> (ScanResult, Vec<u8>) {
    let mut tar = Vec::new();
    let result = archive_and_scan_output_directory(output_dir, &mut tar, build_dir, s(store), deps)
      .await
      .unwrap();
    (result, tar)
  }

  mod scanning {
    use super::*;

    #[tokio::test]
    async fn hash_ignores_temp_folder_name() {
      let (_root, store) = padded_store();
      let mut hashes = Vec::new();
      for _ in 0..2 {
        let out = store_length_temp_dir(&store).unwrap();
        let self_ref = format!("{}/bin/tool", out.display());
        fs::create_dir(out.join("bin")).unwrap();
        fs::write(out.join("bin/tool"), "echo hi").unwrap();
        fs::write(out.join("wrapper"), format!("exec {self_ref}")).unwrap();
        hashes.push(scan(&out, &store, None, &[]).await.0.hash);
      }
      assert_eq!(hashes[0], hashes[1]);
      assert_eq!(hashes[0].len(), HASH_LEN);
    }

    #[tokio::test]
    async fn hash_ignores_install_root_and_records_dependencies() {
      let (_ra, _rb, store_a, store_b) = two_stores();
      let dep = "d".repeat(HASH_LEN);
      let other = "e".repeat(HASH_LEN);

      let mut results = Vec::new();
      for store in [&store_a, &store_b] {
        let out = store_length_temp_dir(store).unwrap();
        let dep_path = format!("{}/{dep}", store.display());
        fs::write(out.join("script"), format!("#!{dep_path}/bin/sh\n")).unwrap();
        let (result, tar) = scan(&out, store, None, &[dep_path.clone(), format!("{}/{other}", store.display())]).await;

        // the archive copy keeps the local path
        let tar = String::from_utf8_lossy(&tar).into_owned();
        assert!(tar.contains(&dep_path));
        results.push(result);
      }

      assert_eq!(results[0].hash, results[1].hash);
      assert_eq!(results[0].dependencies, vec![dep.clone()]);
    }

    #[tokio::test]
    async fn build_directory_references_are_scrubbed() {
      let (_root, store) = padded_store();
      let mut hashes = Vec::new();
      for _ in 0..2 {
        let build_dir = store_length_temp_dir(&store).unwrap();
        let out = store_length_temp_dir(&store).unwrap();
        fs::write(out.join("log"), format!("built in {}/src", build_dir.display())).unwrap();
        let (result, tar) = scan(&out, &store, Some(&build_dir), &[]).await;
        let tar = String::from_utf8_lossy(&tar).into_owned();
        assert!(!tar.contains(&build_dir.display().to_string()));
        hashes.push(result.hash);
      }
      assert_eq!(hashes[0], hashes[1]);
    }

    #[tokio::test]
    async fn different_content_hashes_differently() {
      let (_root, store) = padded_store();
      let a = store_length_temp_dir(&store).unwrap();
      let b = store_length_temp_dir(&store).unwrap();
      fs::write(a.join("f"), "one").unwrap();
      fs::write(b.join("f"), "two").unwrap();
      assert_ne!(scan(&a, &store, None, &[]).await.0.hash, scan(&b, &store, None, &[]).await.0.hash);
    }

    #[tokio::test]
    async fn missing_output_fails_without_hanging() {
      let (_root, store) = padded_store();
      let missing = store.join("bramble_build_directory000000000");
      let mut tar = Vec::new();
      let result = tokio::time::timeout(
        Duration::from_secs(10),
        archive_and_scan_output_directory(&missing, &mut tar, None, s(&store), &[]),
      )
      .await
      .expect("pipeline deadlocked");
      assert!(result.is_err());
    }
  }

  mod materializing {
    use super::*;

    #[tokio::test]
    async fn output_moves_into_store_under_its_hash() {
      let (_root, store) = padded_store();
      let out = store_length_temp_dir(&store).unwrap();
      let name = out.file_name().unwrap().to_str().unwrap().to_string();
      fs::write(out.join("self"), format!("{}/self", out.display())).unwrap();

      let scan = hash_and_move_build_output(&store, &out, None, &[], &CancellationToken::new())
        .await
        .unwrap();

      let dst = store.join(&scan.hash);
      assert!(dst.is_dir());
      assert!(!out.exists());
      let contents = fs::read_to_string(dst.join("self")).unwrap();
      assert_eq!(contents, format!("{}/self", dst.display()));
      assert!(!contents.contains(&name));

      // only the materialized output is left behind
      let entries: Vec<_> = fs::read_dir(&store).unwrap().collect();
      assert_eq!(entries.len(), 1);

      hash_normalized_build_output(&dst, &scan.hash, s(&store), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn identical_outputs_deduplicate() {
      let (_root, store) = padded_store();
      let mut scans = Vec::new();
      for _ in 0..2 {
        let out = store_length_temp_dir(&store).unwrap();
        fs::write(out.join("f"), "same").unwrap();
        let scan = hash_and_move_build_output(&store, &out, None, &[], &CancellationToken::new())
          .await
          .unwrap();
        scans.push(scan);
      }
      assert_eq!(scans[0].hash, scans[1].hash);
      assert!(scans[0].moved);
      assert!(!scans[1].moved, "second copy is discarded");
      assert_eq!(fs::read_dir(&store).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn cancelled_build_leaves_nothing_in_store() {
      let (_root, store) = padded_store();
      let out = store_length_temp_dir(&store).unwrap();
      fs::write(out.join("f"), "data").unwrap();
      let cancel = CancellationToken::new();
      cancel.cancel();

      let err = hash_and_move_build_output(&store, &out, None, &[], &cancel).await.unwrap_err();
      assert!(matches!(err, NormalizeError::Cancelled));
      assert_eq!(fs::read_dir(&store).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn verification_detects_tampering() {
      let (_root, store) = padded_store();
      let out = store_length_temp_dir(&store).unwrap();
      fs::write(out.join("f"), "data").unwrap();
      let scan = hash_and_move_build_output(&store, &out, None, &[], &CancellationToken::new())
        .await
        .unwrap();
      let dst = store.join(&scan.hash);
      fs::write(dst.join("f"), "tampered").unwrap();

      let err = hash_normalized_build_output(&dst, &scan.hash, s(&store), &[]).await.unwrap_err();
      assert!(matches!(err, NormalizeError::HashMismatch { .. }));
    }
  }

  #[test]
  fn scrubbed_build_dir_keeps_length() {
    let store = "/a/store";
    let dir = format!("{store}/bramble_build_directory123456789");
    let scrubbed = scrubbed_build_dir(&dir, store);
    assert_eq!(scrubbed.len(), dir.len());
    assert!(scrubbed.ends_with(&"x".repeat(HASH_LEN)));
  }
}
