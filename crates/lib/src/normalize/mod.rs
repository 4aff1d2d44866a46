//! Output normalization.
//!
//! Build outputs are archived into a reproducible tar stream, rewritten so
//! that nothing about the local install root or the temp directory a build
//! ran in survives, and hashed. The hash names the output in the store.

pub mod archive;
pub mod pipeline;
pub mod textreplace;

use std::io;

use thiserror::Error;

pub use archive::{archive, archive_to, unarchive, unarchive_from};
pub use pipeline::{
  HashWriter, ScanResult, archive_and_scan_output_directory, hash_and_move_build_output, hash_normalized_build_output,
  unarchive_and_replace_output_folder_name,
};
pub use textreplace::{copy_with_frames, in_place_replace_all, replace_bytes, replace_strings_prefix};

#[derive(Debug, Error)]
pub enum NormalizeError {
  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  /// Replacement strings must match in length or every offset in the
  /// stream would shift.
  #[error("old and new values are not the same length ({old} != {new})")]
  NotSameLength { old: usize, new: usize },

  #[error("output hash mismatch: expected {expected}, got {actual}")]
  HashMismatch { expected: String, actual: String },

  #[error("normalization cancelled")]
  Cancelled,

  #[error("normalization task failed: {0}")]
  Task(String),
}

impl NormalizeError {
  pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
    Self::Io {
      context: context.into(),
      source,
    }
  }
}

impl From<tokio::task::JoinError> for NormalizeError {
  fn from(err: tokio::task::JoinError) -> Self {
    Self::Task(err.to_string())
  }
}
