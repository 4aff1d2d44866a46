//! Errors raised while building derivations.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::derivation::TemplateError;
use crate::lockfile::LockfileError;
use crate::normalize::NormalizeError;
use crate::sandbox::SandboxError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BuildError {
  /// The derivation can't be built as written.
  #[error("invalid derivation: {0}")]
  Validation(String),

  /// A dependency derivation or its output is missing from the store.
  #[error("dependency {filename} output {output_name:?} not found in the store")]
  NotFound { filename: String, output_name: String },

  #[error("fetch for {key:?} content doesn't match with the existing hash: {expected:?} was provided but the output was {actual:?}")]
  FetchHashMismatch {
    key: String,
    expected: String,
    actual: String,
  },

  #[error("failed to fetch {url}: {message}")]
  Fetch { url: String, message: String },

  /// The builder process ran and failed.
  #[error("builder failed: {source}")]
  Exec {
    #[source]
    source: SandboxError,
    logs: Option<BuildLogs>,
  },

  #[error("output {output:?} is not reproducible: built {first} then {second}")]
  Reproducibility {
    output: String,
    first: String,
    second: String,
  },

  #[error("error hashing and moving build outputs: {0}")]
  Pipeline(#[from] NormalizeError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lockfile(#[from] LockfileError),

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  /// The task running the build panicked.
  #[error("build panicked: {message}")]
  Panicked { message: String },

  #[error("build was cancelled")]
  Cancelled,
}

impl BuildError {
  pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
    Self::Io {
      context: context.into(),
      source,
    }
  }

  pub(crate) fn validation(message: impl fmt::Display) -> Self {
    Self::Validation(message.to_string())
  }

  /// Captured builder output, when the failure was a builder process that
  /// ran with its output buffered.
  pub fn logs(&self) -> Option<&BuildLogs> {
    match self {
      BuildError::Exec { logs, .. } => logs.as_ref(),
      _ => None,
    }
  }
}

impl From<TemplateError> for BuildError {
  fn from(e: TemplateError) -> Self {
    Self::validation(e)
  }
}

impl From<SandboxError> for BuildError {
  fn from(e: SandboxError) -> Self {
    match e {
      SandboxError::Cancelled => Self::Cancelled,
      source => Self::Exec { source, logs: None },
    }
  }
}

/// Buffered stdout and stderr of a builder. The file is deleted on drop.
#[derive(Debug)]
pub struct BuildLogs {
  file: NamedTempFile,
}

impl BuildLogs {
  pub(crate) fn new() -> io::Result<Self> {
    Ok(Self {
      file: NamedTempFile::new()?,
    })
  }

  pub(crate) fn writer(&self) -> io::Result<std::fs::File> {
    self.file.reopen()
  }

  /// Rewind and read everything the builder wrote.
  pub fn contents(&self) -> io::Result<String> {
    let mut file = self.file.reopen()?;
    file.seek(SeekFrom::Start(0))?;
    let mut out = String::new();
    file.read_to_string(&mut out)?;
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn logs_can_be_replayed() {
    let logs = BuildLogs::new().unwrap();
    let mut w = logs.writer().unwrap();
    writeln!(w, "compiling").unwrap();
    drop(w);
    assert_eq!(logs.contents().unwrap(), "compiling\n");

    let err = BuildError::Exec {
      source: SandboxError::Exited { code: Some(1) },
      logs: Some(logs),
    };
    assert_eq!(err.logs().unwrap().contents().unwrap(), "compiling\n");
    assert_eq!(err.to_string(), "builder failed: process exited with code 1");
  }

  #[test]
  fn cancelled_sandbox_is_a_cancelled_build() {
    assert!(matches!(BuildError::from(SandboxError::Cancelled), BuildError::Cancelled));
  }
}
