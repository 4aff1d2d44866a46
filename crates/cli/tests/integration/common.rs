//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// A derivation writing `hi` to `$out/hi`.
pub const HELLO: &str = r#"{"name":"hello","builder":"/bin/sh","args":["-c","echo hi > $out/hi"]}"#;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the bramble root and
/// any derivation files.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a file relative to the temp directory and return its path.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Bramble root (isolated per test).
  pub fn root_path(&self) -> PathBuf {
    self.temp.path().join("bramble")
  }

  /// Get a pre-configured Command for the bramble binary.
  ///
  /// `BRAMBLE_PATH` points at the isolated root and `RUST_LOG` is cleared
  /// so stderr only carries the default log level.
  pub fn bramble_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("bramble");
    cmd.env("BRAMBLE_PATH", self.root_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// Run `bramble build --sandbox direct -o json` and return the report.
  pub fn build_json(&self, file: &Path) -> serde_json::Value {
    let out = self
      .bramble_cmd()
      .args(["build", "--sandbox", "direct", "-o", "json"])
      .arg(file)
      .output()
      .unwrap();
    assert!(
      out.status.success(),
      "build failed: {}",
      String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).unwrap()
  }
}
