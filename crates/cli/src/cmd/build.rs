//! Implementation of the `bramble build` command.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::Serialize;

use bramble_lib::builder::{BuildOptions, Builder, build_derivations};
use bramble_lib::derivation::Derivation;
use bramble_lib::lockfile::ProjectLockfile;
use bramble_lib::sandbox::{DirectRunner, Sandbox, default_sandbox};
use bramble_lib::store::Store;
use bramble_lib::store::lock::LockMode;

use super::{cancel_on_ctrl_c, default_parallelism, read_derivations, runtime};
use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_stat, print_success, truncate_hash,
};

/// Lines of a failed builder's log shown in the error report.
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum SandboxKind {
  /// The strongest isolation available on this host
  #[default]
  Auto,
  /// No isolation; only the environment is cleared
  Direct,
}

impl SandboxKind {
  fn sandbox(self) -> Arc<dyn Sandbox> {
    match self {
      SandboxKind::Auto => default_sandbox(),
      SandboxKind::Direct => Arc::new(DirectRunner::new()),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
  pub force: bool,
  pub check: bool,
  pub shell: bool,
  pub parallelism: Option<usize>,
  pub sandbox: SandboxKind,
  pub timeout: Option<Duration>,
}

#[derive(Serialize)]
struct BuiltDerivation {
  filename: String,
  name: String,
  built: bool,
  /// Output name -> store path.
  outputs: BTreeMap<String, String>,
}

fn describe(store: &Store, drv: &Derivation, built: bool) -> BuiltDerivation {
  let outputs = drv
    .output_names
    .iter()
    .zip(&drv.outputs)
    .map(|(name, output)| (name.clone(), store.join(&output.path).display().to_string()))
    .collect();
  BuiltDerivation {
    filename: drv.filename(),
    name: drv.name.clone(),
    built,
    outputs,
  }
}

pub fn cmd_build(file: &Path, args: BuildArgs, verbose: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let drvs = read_derivations(file)?;
  let requested: Vec<String> = drvs.iter().map(Derivation::filename).collect();

  let store = Arc::new(Store::from_env().context("Failed to open store")?);
  let _lock = store
    .lock(LockMode::Exclusive, "build")
    .context("Failed to acquire store lock")?;

  let project_dir = match file.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir,
    _ => Path::new("."),
  };
  let lockfile = Arc::new(ProjectLockfile::open(project_dir).context("Failed to open lockfile")?);
  let builder = Arc::new(Builder::new(store.clone(), args.sandbox.sandbox(), lockfile));

  let opts = BuildOptions {
    force_build: args.force,
    shell: args.shell,
    verbose,
    check: args.check,
  };
  let parallelism = args.parallelism.unwrap_or_else(default_parallelism);

  let rt = runtime()?;
  let result = rt
    .block_on(async {
      let cancel = cancel_on_ctrl_c();
      if let Some(timeout) = args.timeout {
        let token = cancel.clone();
        tokio::spawn(async move {
          tokio::time::sleep(timeout).await;
          tracing::warn!(timeout = %humantime::format_duration(timeout), "build timed out, cancelling");
          token.cancel();
        });
      }
      build_derivations(builder, drvs, &opts, parallelism, &cancel).await
    })
    .context("Build failed")?;

  let report: Vec<BuiltDerivation> = requested
    .iter()
    .filter_map(|filename| result.built.get(filename))
    .map(|(drv, built)| describe(&store, drv, *built))
    .collect();

  if output.is_json() {
    print_json(&report)?;
  } else {
    for drv in &report {
      let verb = if drv.built { "Built" } else { "Cached" };
      print_success(&format!("{verb} {} ({})", drv.name, truncate_hash(&drv.filename)));
      for (name, path) in &drv.outputs {
        print_stat(name, path);
      }
    }
    if !result.skipped.is_empty() {
      print_info(&format!("{} derivation(s) skipped", result.skipped.len()));
    }
    print_stat("Built", &result.build_count().to_string());
    print_stat("Total", &result.total().to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !result.is_success() {
    for (filename, err) in &result.failed {
      print_error(&format!("{filename}: {err}"));
      if let Some(logs) = err.logs()
        && let Ok(contents) = logs.contents()
      {
        let lines: Vec<&str> = contents.lines().collect();
        for line in &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..] {
          eprintln!("    {line}");
        }
      }
    }
    bail!(
      "{} derivation(s) failed, {} skipped",
      result.failed.len(),
      result.skipped.len()
    );
  }

  Ok(())
}
