//! Building a set of derivations in dependency order.
//!
//! The build graph is split into waves; every derivation in a wave has all
//! of its dependencies in earlier waves. Within a wave builds run
//! concurrently, bounded by a semaphore. Before a derivation is built its
//! pending references are resolved against the outputs of the waves before
//! it. When a build fails, everything depending on it is skipped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BuildError, BuildOptions, Builder};
use crate::derivation::Derivation;
use crate::graph::{DependencyGraph, GraphError};

/// Outcome of [`build_derivations`], keyed by the filename each derivation
/// was requested under.
#[derive(Debug, Default)]
pub struct ScheduleResult {
  /// Finished derivations and whether a build ran for them.
  pub built: HashMap<String, (Derivation, bool)>,

  pub failed: Vec<(String, BuildError)>,

  /// Skipped derivation -> the failed dependency that caused it.
  pub skipped: BTreeMap<String, String>,
}

impl ScheduleResult {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn total(&self) -> usize {
    self.built.len() + self.failed.len() + self.skipped.len()
  }

  /// How many derivations were actually built rather than cut off.
  pub fn build_count(&self) -> usize {
    self.built.values().filter(|(_, did_build)| *did_build).count()
  }
}

/// Build `drvs` and everything they depend on.
///
/// Dependencies not in `drvs` must be loadable from the store.
pub async fn build_derivations(
  builder: Arc<Builder>,
  drvs: Vec<Derivation>,
  opts: &BuildOptions,
  parallelism: usize,
  cancel: &CancellationToken,
) -> Result<ScheduleResult, GraphError> {
  let store = builder.store().clone();
  let drvs: Vec<Derivation> = drvs.into_iter().map(Derivation::canonicalize).collect();
  for drv in &drvs {
    store.cache_derivation(drv.clone());
  }

  let graph = DependencyGraph::from_derivations(&store, &drvs)?;
  let waves = graph.waves()?;
  info!(derivations = graph.node_count(), waves = waves.len(), "starting builds");

  let given: HashMap<String, Derivation> = drvs.into_iter().map(|d| (d.filename(), d)).collect();
  let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
  let mut result = ScheduleResult::default();
  let mut failed: HashSet<String> = HashSet::new();

  for (wave_idx, wave) in waves.iter().enumerate() {
    debug!(wave = wave_idx, derivations = wave.len(), "building wave");
    let mut set = JoinSet::new();
    let mut tasks: HashMap<Id, String> = HashMap::new();

    for filename in wave {
      let mut drv = match given.get(filename) {
        Some(drv) => drv.clone(),
        None => store.load_derivation(filename)?.ok_or_else(|| GraphError::NotFound {
          filename: filename.clone(),
          output_name: String::new(),
        })?,
      };

      if let Some(dep) = drv.dependencies.iter().find(|d| failed.contains(&d.filename)) {
        warn!(derivation = %filename, failed_dep = %dep.filename, "skipping build due to failed dependency");
        result.skipped.insert(filename.clone(), dep.filename.clone());
        failed.insert(filename.clone());
        continue;
      }

      let resolved = drv.resolve(|dep_filename, output| {
        match result.built.get(dep_filename) {
          Some((built, _)) => built.output(output).map(|o| o.path.clone()),
          None => store
            .load_derivation(dep_filename)
            .ok()
            .flatten()
            .and_then(|d| d.output(output).map(|o| o.path.clone())),
        }
      });
      debug!(derivation = %filename, resolved, "resolved references");

      let builder = builder.clone();
      let semaphore = semaphore.clone();
      let opts = opts.clone();
      let cancel = cancel.clone();
      let task = set.spawn(async move {
        let Ok(_permit) = semaphore.acquire().await else {
          return Err(BuildError::Cancelled);
        };
        builder.build_derivation(drv, &opts, &cancel).await
      });
      tasks.insert(task.id(), filename.clone());
    }

    while let Some(joined) = set.join_next_with_id().await {
      let (filename, built) = match joined {
        Ok((id, built)) => (tasks.remove(&id), built),
        Err(e) => (tasks.remove(&e.id()), Err(panicked(e))),
      };
      let Some(filename) = filename else {
        continue;
      };
      match built {
        Ok(built) => {
          result.built.insert(filename, built);
        }
        Err(e) => {
          error!(derivation = %filename, error = %e, "build failed");
          failed.insert(filename.clone());
          result.failed.push((filename, e));
        }
      }
    }
  }

  info!(
    built = result.build_count(),
    total = result.total(),
    failed = result.failed.len(),
    skipped = result.skipped.len(),
    "builds complete"
  );
  Ok(result)
}

fn panicked(e: JoinError) -> BuildError {
  if !e.is_panic() {
    return BuildError::Cancelled;
  }
  let payload = e.into_panic();
  let message = payload
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string());
  BuildError::Panicked { message }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::consts::BUILTIN_FETCH_URL;
  use crate::derivation::{DerivationOutput, Template};
  use crate::lockfile::MemoryLockfile;
  use crate::sandbox::{DirectRunner, RunOptions, Sandbox, SandboxError};
  use async_trait::async_trait;
  use crate::util::testutil::test_store;
  use std::collections::BTreeMap;
  use tempfile::TempDir;

  fn builder() -> (TempDir, Arc<Builder>) {
    builder_with(Arc::new(DirectRunner::new()))
  }

  fn builder_with(sandbox: Arc<dyn Sandbox>) -> (TempDir, Arc<Builder>) {
    let (root, store) = test_store();
    let builder = Builder::new(Arc::new(store), sandbox, Arc::new(MemoryLockfile::new()));
    (root, Arc::new(builder))
  }

  /// Runs builds directly, except those with `CRASH` set, which panic.
  struct CrashingSandbox(DirectRunner);

  #[async_trait]
  impl Sandbox for CrashingSandbox {
    async fn run(&self, opts: RunOptions, cancel: &CancellationToken) -> Result<(), SandboxError> {
      if opts.env.contains_key("CRASH") {
        panic!("sandbox crashed");
      }
      self.0.run(opts, cancel).await
    }

    fn name(&self) -> &'static str {
      "crashing"
    }
  }

  fn fetch(url: &str) -> Derivation {
    Derivation {
      name: "hi".to_string(),
      builder: Template::text(BUILTIN_FETCH_URL),
      env: BTreeMap::from([("url".to_string(), Template::text(url))]),
      ..Default::default()
    }
    .canonicalize()
  }

  /// A shell derivation with `$src` bound to `dep`'s output.
  fn script(name: &str, dep: Option<&Derivation>, script: &str) -> Derivation {
    let mut env = BTreeMap::from([("PATH".to_string(), Template::text("/bin:/usr/bin"))]);
    let mut dependencies = Vec::new();
    if let Some(dep) = dep {
      env.insert("src".to_string(), Template::pending(dep.filename(), "out"));
      dependencies.push(DerivationOutput::new(dep.filename(), "out"));
    }
    Derivation {
      name: name.to_string(),
      builder: Template::text("/bin/sh"),
      args: vec![Template::text("-c"), Template::text(script)],
      env,
      dependencies,
      ..Default::default()
    }
    .canonicalize()
  }

  fn read_output(builder: &Builder, result: &ScheduleResult, drv: &Derivation, file: &str) -> String {
    let (built, _) = &result.built[&drv.filename()];
    std::fs::read_to_string(builder.store().join(&built.outputs[0].path).join(file)).unwrap()
  }

  #[tokio::test]
  async fn changing_a_recipe_rebuilds_only_its_dependents() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/hi.txt")
      .with_body("hi")
      .expect(1)
      .create_async()
      .await;
    let (_root, builder) = builder();
    let opts = BuildOptions::default();
    let cancel = CancellationToken::new();

    let a = fetch(&format!("{}/hi.txt", server.url()));
    let b = script("b", Some(&a), "cat \"$src/hi.txt\" > \"$out/copy\"");
    let c = script("c", Some(&b), "cat \"$src/copy\" > \"$out/again\"");
    let result = build_derivations(builder.clone(), vec![c.clone(), b.clone(), a.clone()], &opts, 4, &cancel)
      .await
      .unwrap();
    assert!(result.is_success(), "{:?}", result.failed);
    assert_eq!(result.build_count(), 3);
    assert_eq!(read_output(&builder, &result, &c, "again"), "hi");

    let b2 = script("b", Some(&a), "cat \"$src/hi.txt\" \"$src/hi.txt\" > \"$out/copy\"");
    let c2 = script("c", Some(&b2), "cat \"$src/copy\" > \"$out/again\"");
    let result = build_derivations(builder.clone(), vec![a.clone(), b2.clone(), c2.clone()], &opts, 4, &cancel)
      .await
      .unwrap();
    assert!(result.is_success());
    assert!(!result.built[&a.filename()].1, "fetch should be cut off");
    assert!(result.built[&b2.filename()].1);
    assert!(result.built[&c2.filename()].1);
    assert_eq!(read_output(&builder, &result, &c2, "again"), "hihi");
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn unchanged_graph_is_cut_off() {
    let (_root, builder) = builder();
    let a = script("a", None, "echo a > \"$out/a\"");
    let b = script("b", Some(&a), "cat \"$src/a\" > \"$out/b\"");
    let opts = BuildOptions::default();
    let cancel = CancellationToken::new();

    let first = build_derivations(builder.clone(), vec![a.clone(), b.clone()], &opts, 2, &cancel)
      .await
      .unwrap();
    assert_eq!(first.build_count(), 2);

    let second = build_derivations(builder.clone(), vec![a, b], &opts, 2, &cancel).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.build_count(), 0);
    assert_eq!(second.total(), 2);
  }

  #[tokio::test]
  async fn failures_skip_dependents() {
    let (_root, builder) = builder();
    let broken = script("broken", None, "exit 1");
    let fine = script("fine", None, "echo ok > \"$out/ok\"");
    let downstream = script("downstream", Some(&broken), "cat \"$src/x\" > \"$out/y\"");

    let result = build_derivations(
      builder,
      vec![broken.clone(), fine.clone(), downstream.clone()],
      &BuildOptions::default(),
      2,
      &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!result.is_success());
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, broken.filename());
    assert_eq!(result.skipped.get(&downstream.filename()), Some(&broken.filename()));
    assert!(result.built.contains_key(&fine.filename()));
  }

  #[tokio::test]
  async fn panicking_builds_fail_and_skip_dependents() {
    let (_root, builder) = builder_with(Arc::new(CrashingSandbox(DirectRunner::new())));
    let mut crashing = script("crashing", None, "echo never > \"$out/x\"");
    crashing.env.insert("CRASH".to_string(), Template::text("1"));
    let crashing = crashing.canonicalize();
    let fine = script("fine", None, "echo ok > \"$out/ok\"");
    let downstream = script("downstream", Some(&crashing), "cat \"$src/x\" > \"$out/y\"");

    let result = build_derivations(
      builder,
      vec![crashing.clone(), fine.clone(), downstream.clone()],
      &BuildOptions::default(),
      2,
      &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!result.is_success());
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, crashing.filename());
    assert!(
      matches!(&result.failed[0].1, BuildError::Panicked { message } if message == "sandbox crashed"),
      "{:?}",
      result.failed[0].1
    );
    assert_eq!(result.skipped.get(&downstream.filename()), Some(&crashing.filename()));
    assert!(result.built.contains_key(&fine.filename()));
    assert_eq!(result.total(), 3);
  }
}
