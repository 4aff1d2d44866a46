//! Remote caches for derivations and their outputs.
//!
//! A cache is a flat object store. `derivation/{filename}` holds the JSON
//! of a normalized derivation; `output/{hash}` holds a reproducible tar of
//! an output in which every local store path has been swapped for
//! [`BRAMBLE_PREFIX_OF_RECORD`](crate::consts::BRAMBLE_PREFIX_OF_RECORD),
//! so one artifact serves every install root.
//!
//! Two backends implement [`RemoteCache`]: [`HttpCache`] talks to the
//! routes served by [`server::router`], and [`DirectoryCache`] keeps the
//! objects in a local directory. [`transfer`] moves objects between a
//! [`Store`](crate::store::Store) and either of them.

pub mod client;
pub mod directory;
pub mod server;
pub mod transfer;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::normalize::NormalizeError;
use crate::store::StoreError;

pub use client::HttpCache;
pub use directory::DirectoryCache;
pub use transfer::{UploadReport, fetch_from_cache, upload_derivations};

/// A streamed object body.
pub type CacheReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("object {0:?} not found in cache")]
  NotFound(String),

  #[error("invalid cache key {0:?}")]
  InvalidKey(String),

  #[error("request to {url} failed: {message}")]
  Request { url: String, message: String },

  #[error("unexpected status {status} from {url}: {body}")]
  Status { url: String, status: u16, body: String },

  #[error("decoding derivation {filename}: {source}")]
  Decode {
    filename: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("derivation {0} has not been built")]
  NotBuilt(String),

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  #[error("cache transfer cancelled")]
  Cancelled,

  #[error(transparent)]
  Normalize(#[from] NormalizeError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl CacheError {
  pub fn io(context: impl Into<String>, source: io::Error) -> Self {
    Self::Io {
      context: context.into(),
      source,
    }
  }
}

/// Address of an object in a cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
  Derivation(String),
  Output(String),
}

impl CacheKey {
  pub fn derivation(filename: impl Into<String>) -> Self {
    Self::Derivation(filename.into())
  }

  pub fn output(hash: impl Into<String>) -> Self {
    Self::Output(hash.into())
  }

  /// Parse `derivation/{filename}` or `output/{hash}`.
  pub fn parse(path: &str) -> Result<Self, CacheError> {
    let invalid = || CacheError::InvalidKey(path.to_string());
    let (kind, name) = path.split_once('/').ok_or_else(invalid)?;
    if !is_object_name(name) {
      return Err(invalid());
    }
    match kind {
      "derivation" => Ok(Self::Derivation(name.to_string())),
      "output" => Ok(Self::Output(name.to_string())),
      _ => Err(invalid()),
    }
  }

  /// The filename or hash part of the key.
  pub fn name(&self) -> &str {
    match self {
      Self::Derivation(name) | Self::Output(name) => name,
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Derivation(filename) => write!(f, "derivation/{filename}"),
      Self::Output(hash) => write!(f, "output/{hash}"),
    }
  }
}

/// A single path segment that can't escape the directory it is joined to.
pub(crate) fn is_object_name(name: &str) -> bool {
  !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Object storage for derivations and outputs.
#[async_trait]
pub trait RemoteCache: Send + Sync {
  async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError>;

  /// Stream an object. Missing objects are [`CacheError::NotFound`].
  async fn get(&self, key: &CacheKey) -> Result<CacheReader, CacheError>;

  /// Store an object, reading `body` to the end.
  async fn put(&self, key: &CacheKey, body: CacheReader) -> Result<(), CacheError>;

  /// Where the cache lives, for logs.
  fn location(&self) -> String;
}

/// Open a cache from a URL (`http://`, `https://`) or a directory path.
pub fn open(location: &str) -> Result<Arc<dyn RemoteCache>, CacheError> {
  if location.starts_with("http://") || location.starts_with("https://") {
    return Ok(Arc::new(HttpCache::new(location)));
  }
  let path = PathBuf::from(location.strip_prefix("file://").unwrap_or(location));
  Ok(Arc::new(DirectoryCache::new(path)))
}
