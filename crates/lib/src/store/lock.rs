//! Advisory `flock` over a bramble root.
//!
//! Commands that write to the store hold `{bramble}/var/.lock` exclusively
//! for their whole run and record themselves in it, so a second process can
//! name the command it collided with. Readers take the lock shared and leave
//! the record alone.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds an exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  pub started_at_unix: u64,
  pub bramble_path: PathBuf,
}

impl LockHolder {
  fn current(command: &str, bramble_path: &Path) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default(),
      bramble_path: bramble_path.to_path_buf(),
    }
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("{}\nremove {} if no bramble process is running", describe_holder(.holder), .lock_path.display())]
  Locked {
    holder: Option<LockHolder>,
    lock_path: PathBuf,
  },

  #[error("lock file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn describe_holder(holder: &Option<LockHolder>) -> String {
  match holder {
    Some(h) => format!(
      "store is locked by `bramble {}` (pid {}, since unix time {})",
      h.command, h.pid, h.started_at_unix
    ),
    None => "store is locked by another process".to_string(),
  }
}

/// A held lock, released when dropped.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Take the lock in `var_dir` without waiting.
  pub fn acquire(var_dir: &Path, bramble_path: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let path = var_dir.join(LOCK_FILENAME);
    let io_err = |source| StoreLockError::Io {
      path: path.clone(),
      source,
    };

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(io_err)?;

    if !try_lock(&file, mode).map_err(io_err)? {
      return Err(StoreLockError::Locked {
        holder: read_holder(&file),
        lock_path: path,
      });
    }

    if mode == LockMode::Exclusive {
      record(&file, &LockHolder::current(command, bramble_path)).map_err(io_err)?;
    }
    Ok(StoreLock { file, path, mode })
  }

  /// The holder recorded in the lock file, if any.
  pub fn holder(&self) -> Option<LockHolder> {
    read_holder(&self.file)
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

fn record(mut file: &File, holder: &LockHolder) -> io::Result<()> {
  file.set_len(0)?;
  file.seek(SeekFrom::Start(0))?;
  serde_json::to_writer(&mut file, holder).map_err(io::Error::other)?;
  file.flush()
}

fn read_holder(mut file: &File) -> Option<LockHolder> {
  file.seek(SeekFrom::Start(0)).ok()?;
  serde_json::from_reader(file).ok()
}

/// `Ok(false)` when another process holds a conflicting lock.
#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
  use rustix::fs::{FlockOperation, flock};

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  match flock(file, operation) {
    Ok(()) => Ok(true),
    Err(e) if e == rustix::io::Errno::WOULDBLOCK => Ok(false),
    Err(e) => Err(e.into()),
  }
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _mode: LockMode) -> io::Result<bool> {
  Ok(true)
}
