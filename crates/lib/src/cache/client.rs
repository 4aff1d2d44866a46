//! HTTP client for a cache server.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::{CacheError, CacheKey, CacheReader, RemoteCache};

/// A cache reached over the routes of [`super::server::router`].
///
/// Objects are read with `GET /derivation/{filename}` and
/// `GET /output/{hash}`, and written with `POST /derivation` and
/// `POST /output?hash={hash}`.
#[derive(Debug, Clone)]
pub struct HttpCache {
  host: String,
  client: reqwest::Client,
}

impl HttpCache {
  pub fn new(host: impl AsRef<str>) -> Self {
    Self::with_client(host, reqwest::Client::new())
  }

  pub fn with_client(host: impl AsRef<str>, client: reqwest::Client) -> Self {
    Self {
      host: host.as_ref().trim_end_matches('/').to_string(),
      client,
    }
  }

  fn url(&self, key: &CacheKey) -> String {
    format!("{}/{key}", self.host)
  }

  fn request_error(url: &str, e: impl std::fmt::Display) -> CacheError {
    CacheError::Request {
      url: url.to_string(),
      message: e.to_string(),
    }
  }

  async fn status_error(url: &str, response: reqwest::Response) -> CacheError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    CacheError::Status {
      url: url.to_string(),
      status,
      body: body.trim().to_string(),
    }
  }

  async fn post_derivation(&self, filename: &str, mut body: CacheReader) -> Result<(), CacheError> {
    let url = format!("{}/derivation", self.host);
    let mut json = Vec::new();
    body
      .read_to_end(&mut json)
      .await
      .map_err(|e| CacheError::io("reading derivation body", e))?;

    let response = self
      .client
      .post(&url)
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(json)
      .send()
      .await
      .map_err(|e| Self::request_error(&url, e))?;
    if !response.status().is_success() {
      return Err(Self::status_error(&url, response).await);
    }

    let stored = response.text().await.map_err(|e| Self::request_error(&url, e))?;
    if stored.trim() != filename {
      return Err(Self::request_error(
        &url,
        format!("server stored derivation as {:?}, expected {filename:?}", stored.trim()),
      ));
    }
    Ok(())
  }

  async fn post_output(&self, hash: &str, body: CacheReader) -> Result<(), CacheError> {
    let url = format!("{}/output", self.host);
    let response = self
      .client
      .post(&url)
      .query(&[("hash", hash)])
      .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
      .send()
      .await
      .map_err(|e| Self::request_error(&url, e))?;
    if !response.status().is_success() {
      return Err(Self::status_error(&url, response).await);
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteCache for HttpCache {
  async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
    let url = self.url(key);
    let response = self
      .client
      .head(&url)
      .send()
      .await
      .map_err(|e| Self::request_error(&url, e))?;
    match response.status() {
      StatusCode::OK => Ok(true),
      StatusCode::NOT_FOUND => Ok(false),
      _ => Err(Self::status_error(&url, response).await),
    }
  }

  async fn get(&self, key: &CacheKey) -> Result<CacheReader, CacheError> {
    let url = self.url(key);
    debug!(url = %url, "fetching from cache");
    let response = self
      .client
      .get(&url)
      .send()
      .await
      .map_err(|e| Self::request_error(&url, e))?;
    match response.status() {
      StatusCode::OK => {
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
      }
      StatusCode::NOT_FOUND => Err(CacheError::NotFound(key.to_string())),
      _ => Err(Self::status_error(&url, response).await),
    }
  }

  async fn put(&self, key: &CacheKey, body: CacheReader) -> Result<(), CacheError> {
    debug!(key = %key, host = %self.host, "uploading to cache");
    match key {
      CacheKey::Derivation(filename) => self.post_derivation(filename, body).await,
      CacheKey::Output(hash) => self.post_output(hash, body).await,
    }
  }

  fn location(&self) -> String {
    self.host.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mockito::Matcher;
  use std::io::Cursor;

  fn body(bytes: &'static [u8]) -> CacheReader {
    Box::new(Cursor::new(bytes))
  }

  #[tokio::test]
  async fn exists_maps_status_codes() {
    let mut server = mockito::Server::new_async().await;
    let present = server.mock("HEAD", "/output/present").with_status(200).create_async().await;
    let missing = server.mock("HEAD", "/output/missing").with_status(404).create_async().await;
    let broken = server.mock("HEAD", "/output/broken").with_status(500).create_async().await;
    let cache = HttpCache::new(server.url());

    assert!(cache.exists(&CacheKey::output("present")).await.unwrap());
    assert!(!cache.exists(&CacheKey::output("missing")).await.unwrap());
    assert!(matches!(
      cache.exists(&CacheKey::output("broken")).await,
      Err(CacheError::Status { status: 500, .. })
    ));
    present.assert_async().await;
    missing.assert_async().await;
    broken.assert_async().await;
  }

  #[tokio::test]
  async fn get_streams_the_body() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/derivation/abc-x.drv")
      .with_body("{\"name\":\"x\"}")
      .create_async()
      .await;
    let cache = HttpCache::new(format!("{}/", server.url()));

    let mut reader = cache.get(&CacheKey::derivation("abc-x.drv")).await.unwrap();
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "{\"name\":\"x\"}");
  }

  #[tokio::test]
  async fn get_missing_is_not_found() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/output/nope").with_status(404).create_async().await;
    let cache = HttpCache::new(server.url());

    let err = cache.get(&CacheKey::output("nope")).await.err().unwrap();
    assert!(matches!(err, CacheError::NotFound(ref k) if k == "output/nope"), "{err}");
  }

  #[tokio::test]
  async fn put_output_posts_with_hash_query() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/output")
      .match_query(Matcher::UrlEncoded("hash".into(), "abc".into()))
      .match_body("tarbytes")
      .with_status(200)
      .create_async()
      .await;
    let cache = HttpCache::new(server.url());

    cache.put(&CacheKey::output("abc"), body(b"tarbytes")).await.unwrap();
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn put_derivation_checks_the_returned_filename() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("POST", "/derivation")
      .match_header("content-type", "application/json")
      .with_body("other.drv")
      .create_async()
      .await;
    let cache = HttpCache::new(server.url());

    let err = cache
      .put(&CacheKey::derivation("mine.drv"), body(b"{}"))
      .await
      .err()
      .unwrap();
    assert!(err.to_string().contains("other.drv"), "{err}");
  }

  #[tokio::test]
  async fn rejected_upload_reports_status_and_body() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("POST", "/output")
      .match_query(Matcher::Any)
      .with_status(400)
      .with_body("hash mismatch\n")
      .create_async()
      .await;
    let cache = HttpCache::new(server.url());

    let err = cache.put(&CacheKey::output("abc"), body(b"x")).await.err().unwrap();
    match err {
      CacheError::Status { status, body, .. } => {
        assert_eq!(status, 400);
        assert_eq!(body, "hash mismatch");
      }
      other => panic!("unexpected error {other}"),
    }
  }
}
