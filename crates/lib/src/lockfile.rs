//! Pinned hashes for network fetches.
//!
//! The first time a URL is fetched its content hash is recorded; later
//! fetches of the same URL must reproduce it. Entries live in
//! `bramble.lock` next to the project.
//!
//! # Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "url_hashes": {
//!     "basic_fetch_url https://example.com/a.tar.gz": "4oymiquy7qobjgx36tejs35zeqt24qpe"
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::LOCKFILE_NAME;

pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LockfileError {
  #[error("failed to read lockfile: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write lockfile: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse lockfile: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize lockfile: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported lockfile version {0}, expected {LOCK_VERSION}")]
  UnsupportedVersion(u32),

  #[error("existing lockfile entry found for {key:?}, old hash {existing:?} does not equal new hash {new:?}")]
  Conflict { key: String, existing: String, new: String },
}

/// Where the builder records and looks up fetch hashes.
pub trait LockfileWriter: Send + Sync {
  /// Record `value` for `key`. Recording a different value for an existing
  /// key is an error.
  fn add_entry(&self, key: &str, value: &str) -> Result<(), LockfileError>;

  fn lookup_entry(&self, key: &str) -> Option<String>;
}

/// On-disk lockfile contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
  pub version: u32,
  #[serde(default)]
  pub url_hashes: BTreeMap<String, String>,
}

impl Default for LockFile {
  fn default() -> Self {
    Self {
      version: LOCK_VERSION,
      url_hashes: BTreeMap::new(),
    }
  }
}

impl LockFile {
  /// Load from `path`; a missing file is `Ok(None)`.
  pub fn load(path: &Path) -> Result<Option<Self>, LockfileError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(LockfileError::Read(e)),
    };
    let lock: LockFile = serde_json::from_str(&content).map_err(LockfileError::Parse)?;
    if lock.version != LOCK_VERSION {
      return Err(LockfileError::UnsupportedVersion(lock.version));
    }
    Ok(Some(lock))
  }

  pub fn save(&self, path: &Path) -> Result<(), LockfileError> {
    let mut content = serde_json::to_string_pretty(self).map_err(LockfileError::Serialize)?;
    content.push('\n');
    fs::write(path, content).map_err(LockfileError::Write)
  }

  fn insert(&mut self, key: &str, value: &str) -> Result<bool, LockfileError> {
    match self.url_hashes.get(key) {
      Some(existing) if existing != value => Err(LockfileError::Conflict {
        key: key.to_string(),
        existing: existing.clone(),
        new: value.to_string(),
      }),
      Some(_) => Ok(false),
      None => {
        self.url_hashes.insert(key.to_string(), value.to_string());
        Ok(true)
      }
    }
  }
}

/// A project's `bramble.lock`, written through on every new entry.
#[derive(Debug)]
pub struct ProjectLockfile {
  path: PathBuf,
  inner: RwLock<LockFile>,
}

impl ProjectLockfile {
  /// Open the lockfile in `dir`, starting empty if there is none.
  pub fn open(dir: &Path) -> Result<Self, LockfileError> {
    let path = dir.join(LOCKFILE_NAME);
    let lock = LockFile::load(&path)?.unwrap_or_default();
    Ok(Self {
      path,
      inner: RwLock::new(lock),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn snapshot(&self) -> LockFile {
    self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Merge with whatever is on disk now and write the result.
  fn flush(&self, lock: &LockFile) -> Result<(), LockfileError> {
    let mut merged = LockFile::load(&self.path)?.unwrap_or_default();
    for (key, value) in &lock.url_hashes {
      merged.insert(key, value)?;
    }
    merged.save(&self.path)
  }
}

impl LockfileWriter for ProjectLockfile {
  fn add_entry(&self, key: &str, value: &str) -> Result<(), LockfileError> {
    let mut lock = self.inner.write().unwrap_or_else(|e| e.into_inner());
    if lock.insert(key, value)? {
      self.flush(&lock)?;
    }
    Ok(())
  }

  fn lookup_entry(&self, key: &str) -> Option<String> {
    let lock = self.inner.read().unwrap_or_else(|e| e.into_inner());
    lock.url_hashes.get(key).cloned()
  }
}

/// A lockfile that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryLockfile {
  inner: RwLock<LockFile>,
}

impl MemoryLockfile {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn entries(&self) -> BTreeMap<String, String> {
    self.inner.read().unwrap_or_else(|e| e.into_inner()).url_hashes.clone()
  }
}

impl LockfileWriter for MemoryLockfile {
  fn add_entry(&self, key: &str, value: &str) -> Result<(), LockfileError> {
    self.inner.write().unwrap_or_else(|e| e.into_inner()).insert(key, value)?;
    Ok(())
  }

  fn lookup_entry(&self, key: &str) -> Option<String> {
    self
      .inner
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .url_hashes
      .get(key)
      .cloned()
  }
}
