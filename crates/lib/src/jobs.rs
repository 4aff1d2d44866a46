//! A small in-memory record of recent jobs run by the cache server.
//!
//! Only the most recent [`MAX_JOBS`] jobs are kept; adding one more evicts
//! the job with the oldest start time. Ids and start times come from
//! injectable sources so tests can pin them down.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Jobs held at once.
pub const MAX_JOBS: usize = 6;

/// Attempts at drawing an unused id before giving up.
const ID_ATTEMPTS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
  #[error("job {0:?} not found")]
  NotFound(String),

  #[error("could not find an unused job id after {0} attempts")]
  IdExhausted(usize),
}

/// What a job was asked to do: mirror derivation `filename`, with its
/// outputs, from the remote cache at `cache`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
  /// Cache location, as accepted by [`crate::cache::open`].
  pub cache: String,
  pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
  pub id: String,
  pub start: SystemTime,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub end: Option<SystemTime>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub request: JobRequest,
}

impl Job {
  pub fn is_finished(&self) -> bool {
    self.end.is_some()
  }
}

type IdSource = Box<dyn Fn() -> String + Send + Sync>;
type Clock = Box<dyn Fn() -> SystemTime + Send + Sync>;

pub struct JobQueue {
  jobs: Mutex<HashMap<String, Job>>,
  next_id: IdSource,
  now: Clock,
}

impl std::fmt::Debug for JobQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobQueue").field("jobs", &self.len()).finish()
  }
}

impl Default for JobQueue {
  fn default() -> Self {
    Self::new()
  }
}

impl JobQueue {
  /// Random ids and the system clock.
  pub fn new() -> Self {
    Self::with_sources(|| uuid::Uuid::new_v4().simple().to_string(), SystemTime::now)
  }

  pub fn with_sources<I, C>(next_id: I, now: C) -> Self
  where
    I: Fn() -> String + Send + Sync + 'static,
    C: Fn() -> SystemTime + Send + Sync + 'static,
  {
    Self {
      jobs: Mutex::new(HashMap::new()),
      next_id: Box::new(next_id),
      now: Box::new(now),
    }
  }

  /// Record a new job started now and return a copy of it.
  pub fn add(&self, request: JobRequest) -> Result<Job, JobError> {
    let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let id = (0..ID_ATTEMPTS)
      .map(|_| (self.next_id)())
      .find(|id| !jobs.contains_key(id))
      .ok_or(JobError::IdExhausted(ID_ATTEMPTS))?;

    if jobs.len() >= MAX_JOBS
      && let Some(oldest) = jobs.values().min_by_key(|j| j.start).map(|j| j.id.clone())
    {
      debug!(job = %oldest, "evicting oldest job");
      jobs.remove(&oldest);
    }

    let job = Job {
      id: id.clone(),
      start: (self.now)(),
      end: None,
      error: None,
      request,
    };
    jobs.insert(id, job.clone());
    Ok(job)
  }

  /// Mark a job finished, recording the error if it failed.
  pub fn finish(&self, id: &str, result: Result<(), String>) -> Result<Job, JobError> {
    let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let job = jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
    job.end = Some((self.now)());
    job.error = result.err();
    Ok(job.clone())
  }

  /// A copy of the job; later changes to the queue don't affect it.
  pub fn lookup(&self, id: &str) -> Option<Job> {
    let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
    jobs.get(id).cloned()
  }

  /// Every job, oldest first.
  pub fn list(&self) -> Vec<Job> {
    let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let mut list: Vec<Job> = jobs.values().cloned().collect();
    list.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    list
  }

  pub fn len(&self) -> usize {
    self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
