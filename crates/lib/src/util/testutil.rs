//! Test helpers shared by the unit tests.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::consts::PATH_PADDING_LENGTH;
use crate::store::Store;
use crate::store::paths::calculate_padded_directory_name;

/// A bare padded store directory under a fresh temp root.
pub fn padded_store() -> (TempDir, PathBuf) {
  let root = TempDir::new().unwrap();
  let bramble = root.path().to_str().unwrap().to_string();
  let suffix = calculate_padded_directory_name(&bramble, PATH_PADDING_LENGTH).unwrap();
  let store = PathBuf::from(format!("{bramble}{suffix}"));
  std::fs::create_dir_all(&store).unwrap();
  (root, store)
}

/// A fully initialized store under a fresh temp root.
pub fn test_store() -> (TempDir, Store) {
  let root = TempDir::new().unwrap();
  let store = Store::open(root.path().join("bramble")).unwrap();
  (root, store)
}

/// Shell and args running `script`.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}
