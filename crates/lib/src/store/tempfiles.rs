//! Fixed-length temp directories and files inside the store.
//!
//! Names are [`BUILD_DIR_PREFIX`] followed by random digits, always
//! [`HASH_LEN`] characters long, so a temp dir name can later be swapped for
//! a content hash of the same length. Living inside the store keeps the
//! final rename on one filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::consts::{BUILD_DIR_PREFIX, HASH_LEN};

const MAX_ATTEMPTS: usize = 10_000;

fn random_name() -> String {
  let mut rng = rand::thread_rng();
  let digits: String = (0..HASH_LEN - BUILD_DIR_PREFIX.len())
    .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
    .collect();
  format!("{BUILD_DIR_PREFIX}{digits}")
}

/// Create a fresh temp directory inside `dir` with mode 0755.
pub fn store_length_temp_dir(dir: &Path) -> io::Result<PathBuf> {
  for _ in 0..MAX_ATTEMPTS {
    let path = dir.join(random_name());
    match create_dir(&path) {
      Ok(()) => return Ok(path),
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
      Err(e) => return Err(e),
    }
  }
  Err(io::Error::new(
    io::ErrorKind::AlreadyExists,
    format!("could not create a temp dir in {}", dir.display()),
  ))
}

/// Create a fresh, empty temp file inside `dir`.
pub fn store_length_temp_file(dir: &Path) -> io::Result<(fs::File, PathBuf)> {
  for _ in 0..MAX_ATTEMPTS {
    let path = dir.join(random_name());
    match fs::OpenOptions::new()
      .read(true)
      .write(true)
      .create_new(true)
      .open(&path)
    {
      Ok(file) => return Ok((file, path)),
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
      Err(e) => return Err(e),
    }
  }
  Err(io::Error::new(
    io::ErrorKind::AlreadyExists,
    format!("could not create a temp file in {}", dir.display()),
  ))
}

#[cfg(unix)]
fn create_dir(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::DirBuilderExt;
  fs::DirBuilder::new().mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> io::Result<()> {
  fs::create_dir(path)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn temp_dir_name_is_hash_length() {
    let root = tempdir().unwrap();
    let dir = store_length_temp_dir(root.path()).unwrap();
    let name = dir.file_name().unwrap().to_str().unwrap();
    assert_eq!(name.len(), HASH_LEN);
    assert!(name.starts_with(BUILD_DIR_PREFIX));
    assert!(dir.is_dir());
  }

  #[test]
  fn temp_dirs_are_unique() {
    let root = tempdir().unwrap();
    let a = store_length_temp_dir(root.path()).unwrap();
    let b = store_length_temp_dir(root.path()).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn temp_file_is_created_empty() {
    let root = tempdir().unwrap();
    let (_file, path) = store_length_temp_file(root.path()).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    assert_eq!(path.file_name().unwrap().len(), HASH_LEN);
  }

  #[test]
  fn missing_parent_is_an_error() {
    let root = tempdir().unwrap();
    let err = store_length_temp_dir(&root.path().join("missing")).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
  }
}
