//! The `basic_fetch_url` builtin.
//!
//! Downloads `env.url` into the build directory. When the URL's path ends
//! in `.tar.gz` the download is unpacked into `out`; anything else is
//! placed in `out` under the URL's file name.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::BuildError;
use crate::consts::DEFAULT_OUTPUT;
use crate::derivation::RenderedDerivation;
use crate::normalize;

/// Run the fetch for `drv`, writing into the single output directory.
pub(crate) async fn fetch_url_builder(
  client: &reqwest::Client,
  drv: &RenderedDerivation,
  build_dir: &Path,
  outputs: &[(String, PathBuf)],
  cancel: &CancellationToken,
) -> Result<(), BuildError> {
  let out = match outputs {
    [(name, path)] if name == DEFAULT_OUTPUT => path,
    _ => {
      return Err(BuildError::validation(
        "the fetch_url builder can only have the default output \"out\"",
      ));
    }
  };
  let url = drv
    .env
    .get("url")
    .ok_or_else(|| BuildError::validation("fetch_url requires the environment variable 'url' to be set"))?;

  let download = tokio::select! {
    result = download_file(client, url, build_dir) => result?,
    _ = cancel.cancelled() => return Err(BuildError::Cancelled),
  };

  if is_tarball(url) {
    let out = out.clone();
    let archive = download.clone();
    tokio::task::spawn_blocking(move || -> Result<(), BuildError> {
      let file = std::fs::File::open(&archive).map_err(|e| BuildError::io("opening download", e))?;
      normalize::unarchive(flate2::read::GzDecoder::new(file), &out)?;
      Ok(())
    })
    .await
    .map_err(|e| BuildError::Pipeline(e.into()))??;
    fs::remove_file(&download)
      .await
      .map_err(|e| BuildError::io("removing download", e))?;
    debug!(url = %url, "unpacked tarball");
    return Ok(());
  }

  let dst = out.join(url_to_filename(url));
  fs::rename(&download, &dst)
    .await
    .map_err(|e| BuildError::io("moving download into output", e))
}

/// Stream `url` to a file in `dir`, returning its path.
async fn download_file(client: &reqwest::Client, url: &str, dir: &Path) -> Result<PathBuf, BuildError> {
  info!(url = %url, "fetching url");
  let fetch_err = |message: String| BuildError::Fetch {
    url: url.to_string(),
    message,
  };

  let response = client
    .get(url)
    .send()
    .await
    .map_err(|e| fetch_err(format!("error making request: {e}")))?;
  let status = response.status();
  if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
    return Err(fetch_err(format!("Unexpected http status code {}", status.as_u16())));
  }

  let path = dir.join(url_to_filename(url));
  let mut file = fs::File::create(&path)
    .await
    .map_err(|e| BuildError::io("creating download file", e))?;
  let mut body = response.bytes_stream();
  let mut size = 0usize;
  while let Some(chunk) = body.next().await {
    let chunk = chunk.map_err(|e| fetch_err(e.to_string()))?;
    size += chunk.len();
    file
      .write_all(&chunk)
      .await
      .map_err(|e| BuildError::io("writing download", e))?;
  }
  file.flush().await.map_err(|e| BuildError::io("writing download", e))?;

  debug!(url = %url, size, "download complete");
  Ok(path)
}

/// Whether the path of `url`, ignoring any query or fragment, names a
/// gzipped tarball.
fn is_tarball(url: &str) -> bool {
  reqwest::Url::parse(url).is_ok_and(|parsed| parsed.path().ends_with(".tar.gz"))
}

/// The last path segment of `url`, without a query string or fragment,
/// limited to characters that are safe in a file name.
pub(crate) fn url_to_filename(url: &str) -> String {
  let path = url.split(['?', '#']).next().unwrap_or(url);
  let last = path.rsplit('/').next().unwrap_or_default();
  let sanitized: String = last
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect();

  if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
    return "download".to_string();
  }
  sanitized
}
