//! HTTP cache server backed by a [`Store`].
//!
//! | Route                     | Result                                     |
//! |---------------------------|--------------------------------------------|
//! | `GET /derivation/{file}`  | derivation JSON, 404 if unknown            |
//! | `POST /derivation`        | stores the JSON body, answers the filename |
//! | `GET /output/{hash}`      | tar stream of the output, 404 if absent    |
//! | `POST /output?hash={h}`   | unpacks and verifies the tar body          |
//! | `POST /job`               | starts a mirror job, answers its id        |
//! | `GET /job/{id}`           | job record as JSON, 404 if unknown         |
//! | `GET /jobs`               | every recent job, oldest first             |
//!
//! Uploaded outputs are kept exactly as received, with the prefix of
//! record in place of any store path, and are only accepted if they
//! verify against the hash they were posted under.
//!
//! A job pulls a derivation and its outputs from another cache into this
//! server's store in the background. Clients poll the job until it has an
//! end time; a failed job carries its error.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRef, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::transfer::{Relocate, fetch_from_cache, receive_output};
use super::{CacheError, is_object_name};
use crate::consts::BRAMBLE_PREFIX_OF_RECORD;
use crate::derivation::Derivation;
use crate::jobs::{Job, JobError, JobQueue, JobRequest};
use crate::normalize::{self, NormalizeError};
use crate::store::Store;
use crate::util::hash::is_store_hash;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Errors answered to cache clients.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
  #[error("not found")]
  NotFound,

  #[error("{0}")]
  BadRequest(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl IntoResponse for ServerError {
  fn into_response(self) -> Response {
    let status = match &self {
      ServerError::NotFound => StatusCode::NOT_FOUND,
      ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, self.to_string()).into_response()
  }
}

impl From<CacheError> for ServerError {
  fn from(e: CacheError) -> Self {
    match e {
      CacheError::InvalidKey(key) => ServerError::BadRequest(format!("invalid key {key:?}")),
      CacheError::Normalize(NormalizeError::HashMismatch { expected, actual }) => {
        ServerError::BadRequest(format!("output does not match hash {expected}: got {actual}"))
      }
      other => ServerError::Internal(other.to_string()),
    }
  }
}

impl From<JobError> for ServerError {
  fn from(e: JobError) -> Self {
    match e {
      JobError::NotFound(_) => ServerError::NotFound,
      other => ServerError::Internal(other.to_string()),
    }
  }
}

#[derive(Clone)]
struct AppState {
  store: Arc<Store>,
  jobs: Arc<JobQueue>,
}

impl FromRef<AppState> for Arc<Store> {
  fn from_ref(state: &AppState) -> Self {
    state.store.clone()
  }
}

impl FromRef<AppState> for Arc<JobQueue> {
  fn from_ref(state: &AppState) -> Self {
    state.jobs.clone()
  }
}

type StoreState = Arc<Store>;

/// Build the cache router over `store`.
pub fn router(store: Arc<Store>) -> Router {
  router_with_jobs(store, Arc::new(JobQueue::new()))
}

/// Build the cache router over `store`, recording jobs in `jobs`.
pub fn router_with_jobs(store: Arc<Store>, jobs: Arc<JobQueue>) -> Router {
  Router::new()
    .route("/derivation", post(post_derivation))
    .route("/derivation/{filename}", get(get_derivation).head(head_derivation))
    .route("/output", post(post_output))
    .route("/output/{hash}", get(get_output).head(head_output))
    .route("/job", post(post_job))
    .route("/job/{id}", get(get_job))
    .route("/jobs", get(list_jobs))
    .with_state(AppState { store, jobs })
    .layer(TraceLayer::new_for_http())
}

/// Serve the cache on `listener` until `cancel` fires.
pub async fn serve(store: Arc<Store>, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
  if let Ok(addr) = listener.local_addr() {
    info!(addr = %addr, store = %store.store_path().display(), "cache server listening");
  }
  axum::serve(listener, router(store))
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
}

fn load(store: &Store, filename: &str) -> Result<Derivation, ServerError> {
  if !is_object_name(filename) {
    return Err(ServerError::NotFound);
  }
  store
    .load_derivation(filename)
    .map_err(|e| ServerError::Internal(e.to_string()))?
    .ok_or(ServerError::NotFound)
}

async fn get_derivation(State(store): State<StoreState>, Path(filename): Path<String>) -> Result<Response, ServerError> {
  let drv = load(&store, &filename)?;
  Ok(([(header::CONTENT_TYPE, "application/json")], drv.to_json()).into_response())
}

async fn head_derivation(State(store): State<StoreState>, Path(filename): Path<String>) -> Result<StatusCode, ServerError> {
  load(&store, &filename).map(|_| StatusCode::OK)
}

async fn post_derivation(State(store): State<StoreState>, body: Bytes) -> Result<String, ServerError> {
  let drv: Derivation =
    serde_json::from_slice(&body).map_err(|e| ServerError::BadRequest(format!("invalid derivation: {e}")))?;
  let filename = store
    .write_derivation(&drv)
    .map_err(|e| ServerError::Internal(e.to_string()))?;
  info!(filename = %filename, "stored derivation");
  Ok(filename)
}

fn output_dir(store: &Store, hash: &str) -> Result<std::path::PathBuf, ServerError> {
  if !is_store_hash(hash) || !store.has_output(hash) {
    return Err(ServerError::NotFound);
  }
  Ok(store.join(hash))
}

async fn head_output(State(store): State<StoreState>, Path(hash): Path<String>) -> Result<StatusCode, ServerError> {
  output_dir(&store, &hash).map(|_| StatusCode::OK)
}

/// Stream the output as a reproducible tar. Local store paths, if any,
/// go out as the prefix of record.
async fn get_output(State(store): State<StoreState>, Path(hash): Path<String>) -> Result<Response, ServerError> {
  let dir = output_dir(&store, &hash)?;
  let store_path = store.store_path_str().as_bytes().to_vec();

  let (archive_w, mut archive_r) = tokio::io::duplex(PIPE_CAPACITY);
  let (mut body_w, body_r) = tokio::io::duplex(PIPE_CAPACITY);
  tokio::spawn(async move {
    let swapping = async move {
      normalize::replace_bytes(&mut archive_r, &mut body_w, &store_path, BRAMBLE_PREFIX_OF_RECORD.as_bytes()).await?;
      body_w
        .shutdown()
        .await
        .map_err(|e| NormalizeError::io("closing response stream", e))
    };
    if let Err(e) = tokio::try_join!(normalize::archive_to(dir, archive_w), swapping) {
      warn!(hash = %hash, error = %e, "streaming output failed");
    }
  });

  Ok(([(header::CONTENT_TYPE, "application/x-tar")], Body::from_stream(ReaderStream::new(body_r))).into_response())
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
  hash: String,
}

async fn post_output(
  State(store): State<StoreState>,
  Query(query): Query<OutputQuery>,
  body: Body,
) -> Result<StatusCode, ServerError> {
  let stream = body.into_data_stream().map_err(std::io::Error::other);
  let reader = Box::new(StreamReader::new(stream));
  let stored = receive_output(&store, &query.hash, reader, Relocate::Keep, &[]).await?;
  if stored {
    info!(hash = %query.hash, "stored output");
  }
  Ok(StatusCode::OK)
}

async fn post_job(
  State(AppState { store, jobs }): State<AppState>,
  body: Bytes,
) -> Result<String, ServerError> {
  let request: JobRequest =
    serde_json::from_slice(&body).map_err(|e| ServerError::BadRequest(format!("invalid job request: {e}")))?;
  if !is_object_name(&request.filename) {
    return Err(ServerError::BadRequest(format!("invalid derivation filename {:?}", request.filename)));
  }
  let job = jobs.add(request.clone())?;
  info!(job = %job.id, cache = %request.cache, filename = %request.filename, "starting mirror job");

  let id = job.id.clone();
  tokio::spawn(async move {
    let result = mirror(&store, &request).await;
    if let Err(e) = &result {
      warn!(job = %id, error = %e, "mirror job failed");
    }
    if let Err(e) = jobs.finish(&id, result.map_err(|e| e.to_string())) {
      // evicted while running
      warn!(job = %id, error = %e, "finished job is gone");
    }
  });
  Ok(job.id)
}

async fn mirror(store: &Store, request: &JobRequest) -> Result<(), CacheError> {
  let upstream = super::open(&request.cache)?;
  let drv = fetch_from_cache(store, upstream.as_ref(), &request.filename).await?;
  info!(filename = %drv.filename(), outputs = drv.outputs.len(), "mirrored derivation");
  Ok(())
}

async fn get_job(State(jobs): State<Arc<JobQueue>>, Path(id): Path<String>) -> Result<Json<Job>, ServerError> {
  jobs.lookup(&id).map(Json).ok_or(ServerError::NotFound)
}

async fn list_jobs(State(jobs): State<Arc<JobQueue>>) -> Json<Vec<Job>> {
  Json(jobs.list())
}
