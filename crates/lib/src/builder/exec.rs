//! Running a derivation's own builder program in the sandbox.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BuildError, BuildLogs, BuildOptions};
use crate::derivation::RenderedDerivation;
use crate::sandbox::{Mount, RunOptions, Sandbox, SandboxError, StdStream};

pub(crate) struct ExecRequest<'a> {
  pub drv: &'a RenderedDerivation,
  pub store_path: &'a Path,
  pub build_dir: &'a Path,
  pub outputs: &'a [(String, PathBuf)],
  pub opts: &'a BuildOptions,
}

/// Run `[builder, ...args]` with each output directory bound to an
/// environment variable named after the output.
///
/// Unless verbose, stdout and stderr go to a log file that is handed back
/// inside [`BuildError::Exec`] when the builder fails.
pub(crate) async fn regular_builder(
  sandbox: &dyn Sandbox,
  req: ExecRequest<'_>,
  cancel: &CancellationToken,
) -> Result<(), BuildError> {
  let drv = req.drv;
  let builder = &drv.builder;
  if let Err(e) = tokio::fs::metadata(builder).await {
    return Err(BuildError::io(format!("builder location doesn't exist: {builder}"), e));
  }

  let mut env = drv.env.clone();
  let mut mounts = vec![Mount::read_only(req.store_path), Mount::read_write(req.build_dir)];
  for (name, path) in req.outputs {
    env.insert(name.clone(), path.to_string_lossy().into_owned());
    mounts.push(Mount::read_write(path));
  }

  let dir = match &drv.source {
    Some(source) if !source.relative_build_path.is_empty() => req.build_dir.join(&source.relative_build_path),
    _ => req.build_dir.to_path_buf(),
  };

  let mut opts = RunOptions {
    args: std::iter::once(builder.clone()).chain(drv.args.iter().cloned()).collect(),
    env,
    dir: Some(dir),
    mounts,
    network: drv.network,
    stdin: StdStream::Null,
    ..Default::default()
  };

  let logs = if req.opts.shell {
    info!(name = %drv.name, "opening shell for derivation");
    opts.args.truncate(1);
    opts.stdin = StdStream::Inherit;
    opts.interactive = true;
    None
  } else if req.opts.verbose {
    None
  } else {
    let logs = BuildLogs::new().map_err(|e| BuildError::io("creating build log", e))?;
    // one descriptor for both streams so they share an offset
    let stdout = logs.writer().map_err(|e| BuildError::io("opening build log", e))?;
    let stderr = stdout.try_clone().map_err(|e| BuildError::io("opening build log", e))?;
    opts.stdout = StdStream::File(stdout);
    opts.stderr = StdStream::File(stderr);
    Some(logs)
  };

  debug!(builder = %builder, sandbox = sandbox.name(), "running builder");
  match sandbox.run(opts, cancel).await {
    Ok(()) => Ok(()),
    Err(SandboxError::Cancelled) => Err(BuildError::Cancelled),
    Err(source) => Err(BuildError::Exec { source, logs }),
  }
}
