//! Reproducible tar archives.
//!
//! Archiving the same directory tree always yields the same bytes: entries
//! are walked in name order, names are relative, timestamps and ownership
//! are zeroed and modes collapse to `0755` or `0644` depending on the
//! executable bit. Symlink targets are written as GNU long-link records so
//! they live in data blocks rather than in a checksummed header; that keeps
//! the stream valid after in-flight byte replacement.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tar::{EntryType, Header};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::SyncIoBridge;
use walkdir::WalkDir;

use super::NormalizeError;

const LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Write a reproducible tar of the contents of `location` to `out`.
pub fn archive<W: Write>(location: &Path, out: W) -> Result<W, NormalizeError> {
  let mut builder = tar::Builder::new(out);
  let ctx = |what: &str| format!("{what} while archiving {}", location.display());

  for entry in WalkDir::new(location).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(|e| NormalizeError::io(ctx("walking"), e.into()))?;
    let path = entry.path();
    let rel = match path.strip_prefix(location) {
      Ok(rel) if !rel.as_os_str().is_empty() => rel,
      _ => continue,
    };
    let meta = fs::symlink_metadata(path).map_err(|e| NormalizeError::io(ctx("reading metadata"), e))?;
    let file_type = meta.file_type();

    let mut header = blank_header();
    if file_type.is_dir() {
      header.set_entry_type(EntryType::Directory);
      header.set_mode(0o755);
      header.set_size(0);
      let mut name = rel.as_os_str().to_owned();
      name.push("/");
      builder
        .append_data(&mut header, PathBuf::from(name), io::empty())
        .map_err(|e| NormalizeError::io(ctx("appending directory"), e))?;
    } else if file_type.is_symlink() {
      let target = fs::read_link(path).map_err(|e| NormalizeError::io(ctx("reading link"), e))?;
      append_long_link(&mut builder, &target).map_err(|e| NormalizeError::io(ctx("appending link"), e))?;
      header.set_entry_type(EntryType::Symlink);
      header.set_mode(0o777);
      header.set_size(0);
      builder
        .append_data(&mut header, rel, io::empty())
        .map_err(|e| NormalizeError::io(ctx("appending link"), e))?;
    } else if file_type.is_file() {
      header.set_entry_type(EntryType::Regular);
      header.set_mode(if is_executable(&meta) { 0o755 } else { 0o644 });
      header.set_size(meta.len());
      let file = File::open(path).map_err(|e| NormalizeError::io(ctx("opening file"), e))?;
      builder
        .append_data(&mut header, rel, file)
        .map_err(|e| NormalizeError::io(ctx("appending file"), e))?;
    } else {
      tracing::debug!(path = ?path, "skipping special file");
    }
  }

  builder
    .into_inner()
    .map_err(|e| NormalizeError::io(ctx("finishing archive"), e))
}

/// Unpack a tar stream into `location`, then drain whatever trails the
/// end-of-archive marker so the writer on the other side never stalls.
pub fn unarchive<R: Read>(reader: R, location: &Path) -> Result<(), NormalizeError> {
  let mut tar = tar::Archive::new(reader);
  tar.set_preserve_permissions(true);
  tar.set_overwrite(true);
  tar
    .unpack(location)
    .map_err(|e| NormalizeError::io(format!("unpacking into {}", location.display()), e))?;
  let mut rest = tar.into_inner();
  io::copy(&mut rest, &mut io::sink()).map_err(|e| NormalizeError::io("draining archive", e))?;
  Ok(())
}

/// [`archive`] onto an async writer, run on the blocking pool.
pub async fn archive_to<W>(location: PathBuf, writer: W) -> Result<(), NormalizeError>
where
  W: AsyncWrite + Unpin + Send + 'static,
{
  let bridge = SyncIoBridge::new(writer);
  tokio::task::spawn_blocking(move || {
    let mut bridge = archive(&location, bridge)?;
    bridge.flush().map_err(|e| NormalizeError::io("flushing archive", e))?;
    bridge.shutdown().map_err(|e| NormalizeError::io("closing archive", e))
  })
  .await?
}

/// [`unarchive`] from an async reader, run on the blocking pool.
pub async fn unarchive_from<R>(reader: R, location: PathBuf) -> Result<(), NormalizeError>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  let bridge = SyncIoBridge::new(reader);
  tokio::task::spawn_blocking(move || unarchive(bridge, &location)).await?
}

fn blank_header() -> Header {
  let mut header = Header::new_gnu();
  header.set_mtime(0);
  header.set_uid(0);
  header.set_gid(0);
  header
}

fn append_long_link<W: Write>(builder: &mut tar::Builder<W>, target: &Path) -> io::Result<()> {
  let mut data = target.as_os_str().as_encoded_bytes().to_vec();
  data.push(0);

  let mut header = blank_header();
  if let Some(gnu) = header.as_gnu_mut() {
    gnu.name[..LONG_LINK_NAME.len()].copy_from_slice(LONG_LINK_NAME);
  }
  header.set_mode(0o644);
  header.set_size(data.len() as u64);
  header.set_entry_type(EntryType::GNULongLink);
  header.set_cksum();
  builder.append(&header, data.as_slice())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
  false
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn sample_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("bin")).unwrap();
    fs::create_dir_all(dir.path().join("share/empty")).unwrap();
    fs::write(dir.path().join("bin/tool"), "#!/bin/sh\necho hi\n").unwrap();
    fs::write(dir.path().join("readme"), "hello").unwrap();
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(dir.path().join("bin/tool"), fs::Permissions::from_mode(0o700)).unwrap();
      std::os::unix::fs::symlink("bin/tool", dir.path().join("link")).unwrap();
    }
    dir
  }

  #[test]
  fn archive_is_deterministic() {
    let dir = sample_tree();
    let a = archive(dir.path(), Vec::new()).unwrap();
    let b = archive(dir.path(), Vec::new()).unwrap();
    assert_eq!(a, b);
    assert!(!a.is_empty());
  }

  #[test]
  fn archive_ignores_location_and_timestamps() {
    let a = sample_tree();
    let b = sample_tree();
    // different roots, different creation times
    assert_eq!(archive(a.path(), Vec::new()).unwrap(), archive(b.path(), Vec::new()).unwrap());
  }

  #[test]
  fn archive_unarchive_archive_is_idempotent() {
    let dir = sample_tree();
    let first = archive(dir.path(), Vec::new()).unwrap();

    let out = TempDir::new().unwrap();
    unarchive(first.as_slice(), out.path()).unwrap();
    assert_eq!(fs::read_to_string(out.path().join("readme")).unwrap(), "hello");
    assert!(out.path().join("share/empty").is_dir());

    let second = archive(out.path(), Vec::new()).unwrap();
    assert_eq!(first, second);
  }

  #[cfg(unix)]
  #[test]
  fn modes_are_normalized_and_links_kept() {
    use std::os::unix::fs::PermissionsExt;

    let dir = sample_tree();
    let bytes = archive(dir.path(), Vec::new()).unwrap();
    let out = TempDir::new().unwrap();
    unarchive(bytes.as_slice(), out.path()).unwrap();

    let mode = fs::metadata(out.path().join("bin/tool")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    let mode = fs::metadata(out.path().join("readme")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644);
    assert_eq!(fs::read_link(out.path().join("link")).unwrap(), PathBuf::from("bin/tool"));
  }

  #[test]
  fn unarchive_drains_trailing_bytes() {
    let dir = sample_tree();
    let mut bytes = archive(dir.path(), Vec::new()).unwrap();
    bytes.extend(vec![0u8; 4096]);
    let mut reader = io::Cursor::new(bytes);
    let out = TempDir::new().unwrap();
    unarchive(&mut reader, out.path()).unwrap();
    assert_eq!(reader.position() as usize, reader.get_ref().len());
  }

  #[tokio::test]
  async fn async_wrappers_round_trip_through_a_pipe() {
    let dir = sample_tree();
    let out = TempDir::new().unwrap();
    let (writer, reader) = tokio::io::duplex(1024);
    let (a, b) = tokio::join!(
      archive_to(dir.path().to_path_buf(), writer),
      unarchive_from(reader, out.path().to_path_buf())
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(fs::read_to_string(out.path().join("bin/tool")).unwrap(), "#!/bin/sh\necho hi\n");
  }
}
