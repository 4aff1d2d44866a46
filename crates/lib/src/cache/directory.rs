//! A cache kept in a local directory, for shared filesystems and tests.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{CacheError, CacheKey, CacheReader, RemoteCache};

/// Objects live at `{root}/derivation/{filename}` and `{root}/output/{hash}`.
///
/// Writes land in a sibling temp file that is renamed into place, so a
/// reader never sees a partial object.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
  root: PathBuf,
}

impl DirectoryCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn path(&self, key: &CacheKey) -> PathBuf {
    self.root.join(key.to_string())
  }
}

#[async_trait]
impl RemoteCache for DirectoryCache {
  async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
    fs::try_exists(self.path(key))
      .await
      .map_err(|e| CacheError::io(format!("checking {key}"), e))
  }

  async fn get(&self, key: &CacheKey) -> Result<CacheReader, CacheError> {
    match fs::File::open(self.path(key)).await {
      Ok(file) => Ok(Box::new(file)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound(key.to_string())),
      Err(e) => Err(CacheError::io(format!("opening {key}"), e)),
    }
  }

  async fn put(&self, key: &CacheKey, mut body: CacheReader) -> Result<(), CacheError> {
    let path = self.path(key);
    let Some(parent) = path.parent() else {
      return Err(CacheError::InvalidKey(key.to_string()));
    };
    fs::create_dir_all(parent)
      .await
      .map_err(|e| CacheError::io(format!("creating {}", parent.display()), e))?;

    let partial = parent.join(format!(".{}.{}", key.name(), uuid::Uuid::new_v4().simple()));
    let written = async {
      let mut file = fs::File::create(&partial).await?;
      let size = tokio::io::copy(&mut body, &mut file).await?;
      file.flush().await?;
      file.sync_all().await?;
      fs::rename(&partial, &path).await?;
      Ok::<_, io::Error>(size)
    }
    .await;

    match written {
      Ok(size) => {
        debug!(key = %key, size, "stored object");
        Ok(())
      }
      Err(e) => {
        let _ = fs::remove_file(&partial).await;
        Err(CacheError::io(format!("writing {key}"), e))
      }
    }
  }

  fn location(&self) -> String {
    self.root.display().to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tempfile::TempDir;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn put_then_get() {
    let dir = TempDir::new().unwrap();
    let cache = DirectoryCache::new(dir.path());
    let key = CacheKey::output("abc");

    assert!(!cache.exists(&key).await.unwrap());
    cache.put(&key, Box::new(Cursor::new(b"payload".to_vec()))).await.unwrap();
    assert!(cache.exists(&key).await.unwrap());
    assert!(dir.path().join("output/abc").is_file());

    let mut out = Vec::new();
    cache.get(&key).await.unwrap().read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"payload");
  }

  #[tokio::test]
  async fn overwriting_replaces_the_object() {
    let dir = TempDir::new().unwrap();
    let cache = DirectoryCache::new(dir.path());
    let key = CacheKey::derivation("x.drv");

    cache.put(&key, Box::new(Cursor::new(b"one".to_vec()))).await.unwrap();
    cache.put(&key, Box::new(Cursor::new(b"two".to_vec()))).await.unwrap();

    let mut out = String::new();
    cache.get(&key).await.unwrap().read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "two");
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("derivation")).unwrap().collect();
    assert_eq!(leftovers.len(), 1, "no partial files left behind");
  }

  #[tokio::test]
  async fn missing_objects_are_not_found() {
    let dir = TempDir::new().unwrap();
    let cache = DirectoryCache::new(dir.path());
    let err = cache.get(&CacheKey::output("nope")).await.err().unwrap();
    assert!(matches!(err, CacheError::NotFound(_)));
  }
}
