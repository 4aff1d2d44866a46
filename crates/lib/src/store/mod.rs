//! The content-addressed store.
//!
//! # Layout
//!
//! ```text
//! {bramble_path}/
//! ├── store -> ./bramble_store_padding/...     # convenience symlink
//! ├── bramble_store_padding/.../                # the padded store directory
//! │   ├── {hash}-{name}.drv                     # derivation JSON
//! │   ├── {hash}/                               # build outputs and sources
//! │   └── {hash}                                # blobs
//! └── var/
//!     ├── config-registry/{hash}                # project locations seen
//!     └── dependencies/
//! ```
//!
//! The store directory is padded so that `{store_path}/` is always
//! [`PATH_PADDING_LENGTH`] bytes long; see [`paths`].

pub mod cache;
pub mod lock;
pub mod paths;
pub mod tempfiles;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consts::PATH_PADDING_LENGTH;
use crate::derivation::{Derivation, DerivationError, NewDerivationOptions, Output, Source, TemplateError};
use crate::normalize::{self, NormalizeError};
use crate::sandbox::{Mount, RunOptions, Sandbox, SandboxError, StdStream};
use crate::util::fs::{common_path_prefix, copy_files_by_path, path_exists};
use crate::util::hash::{Hasher, hash_string};

use cache::DerivationCache;
use lock::{LockMode, StoreLock, StoreLockError};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("bramble path {0} must be absolute")]
  RelativePath(PathBuf),

  #[error(
    "bramble location creates a path that is too long: {path:?} can't be padded to a {target} character store path"
  )]
  PathTooLong { path: String, target: usize },

  #[error("could not find the home directory; set BRAMBLE_PATH")]
  NoHome,

  #[error("bramble path {0} is not valid UTF-8")]
  NonUtf8Path(PathBuf),

  #[error("calculated store path doesn't exist, did the location change? ({0})")]
  StoreMissing(PathBuf),

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to decode derivation {filename}: {source}")]
  Decode {
    filename: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("derivation {0} has not been built")]
  NotBuilt(String),

  #[error(transparent)]
  Derivation(#[from] DerivationError),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Normalize(#[from] NormalizeError),

  #[error(transparent)]
  Sandbox(#[from] SandboxError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

impl StoreError {
  pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
    Self::Io {
      context: context.into(),
      source,
    }
  }
}

/// Files from a project to bundle into the store as a build source.
#[derive(Debug, Clone, Default)]
pub struct SourceFiles {
  /// Absolute project root.
  pub project_location: PathBuf,
  /// Directory the build runs from, relative to the project root.
  pub location: PathBuf,
  /// Files to include, relative to the project root.
  pub files: Vec<PathBuf>,
}

/// Options for running a command against a built derivation.
#[derive(Debug, Default)]
pub struct RunDerivationOptions {
  pub args: Vec<String>,
  pub network: bool,
  pub dir: Option<PathBuf>,
  pub mounts: Vec<Mount>,
  pub hidden_paths: Vec<PathBuf>,
  pub read_only_paths: Vec<PathBuf>,
  pub stdin: StdStream,
  pub stdout: StdStream,
  pub stderr: StdStream,
  /// Leave the command in the terminal's process group, for shells.
  pub interactive: bool,
}

#[derive(Debug)]
pub struct Store {
  bramble_path: PathBuf,
  store_path: PathBuf,
  store_path_str: String,
  derivations: DerivationCache,
}

impl Store {
  /// Open the store rooted at the bramble path from the environment.
  pub fn from_env() -> Result<Self, StoreError> {
    Self::open(paths::bramble_path_from_env()?)
  }

  /// Open (creating if needed) the store rooted at `bramble_path`.
  pub fn open(bramble_path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let bramble_path = clean(bramble_path.as_ref());
    if !bramble_path.is_absolute() {
      return Err(StoreError::RelativePath(bramble_path));
    }
    let bramble_str = bramble_path
      .to_str()
      .ok_or_else(|| StoreError::NonUtf8Path(bramble_path.clone()))?
      .to_string();

    if !bramble_path.exists() {
      info!(path = %bramble_path.display(), "bramble path doesn't exist, creating");
      fs::create_dir_all(&bramble_path).map_err(|e| StoreError::io("creating bramble path", e))?;
    }

    let suffix = paths::calculate_padded_directory_name(&bramble_str, PATH_PADDING_LENGTH)?;
    let store_path_str = format!("{bramble_str}{suffix}");
    let store_path = PathBuf::from(&store_path_str);

    let link = bramble_path.join("store");
    if !path_exists(&link) {
      fs::create_dir_all(&store_path).map_err(|e| StoreError::io("creating store directory", e))?;
      link_store(&format!(".{suffix}"), &link)?;
    }

    for folder in ["var", "var/config-registry", "var/dependencies"] {
      let dir = bramble_path.join(folder);
      fs::create_dir_all(&dir).map_err(|e| StoreError::io(format!("creating bramble folder {folder:?}"), e))?;
    }

    if !store_path.is_dir() {
      return Err(StoreError::StoreMissing(store_path));
    }

    debug!(store = %store_path_str, "opened store");
    Ok(Self {
      bramble_path,
      store_path,
      store_path_str,
      derivations: DerivationCache::new(),
    })
  }

  pub fn bramble_path(&self) -> &Path {
    &self.bramble_path
  }

  pub fn store_path(&self) -> &Path {
    &self.store_path
  }

  pub fn store_path_str(&self) -> &str {
    &self.store_path_str
  }

  /// `{store_path}/{name}`
  pub fn join(&self, name: &str) -> PathBuf {
    self.store_path.join(name)
  }

  pub fn var_dir(&self) -> PathBuf {
    self.bramble_path.join("var")
  }

  /// True if an output directory named `hash` is present.
  pub fn has_output(&self, hash: &str) -> bool {
    self.join(hash).is_dir()
  }

  pub fn lock(&self, mode: LockMode, command: &str) -> Result<StoreLock, StoreError> {
    Ok(StoreLock::acquire(&self.var_dir(), &self.bramble_path, mode, command)?)
  }

  pub fn temp_dir(&self) -> Result<PathBuf, StoreError> {
    tempfiles::store_length_temp_dir(&self.store_path).map_err(|e| StoreError::io("creating temp dir in store", e))
  }

  pub fn temp_file(&self) -> Result<(fs::File, PathBuf), StoreError> {
    tempfiles::store_length_temp_file(&self.store_path).map_err(|e| StoreError::io("creating temp file in store", e))
  }

  /// Keep a derivation in memory only, so later lookups by filename find it
  /// even though it isn't written yet.
  pub fn cache_derivation(&self, drv: Derivation) -> String {
    self.derivations.insert(drv.canonicalize())
  }

  /// Look a derivation up by filename, in memory first and then on disk.
  ///
  /// An in-memory entry without outputs gives way to an on-disk copy, which
  /// may have been written by a finished build.
  pub fn load_derivation(&self, filename: &str) -> Result<Option<Derivation>, StoreError> {
    let cached = self.derivations.get(filename);
    if let Some(drv) = &cached
      && !drv.missing_output()
    {
      return Ok(cached);
    }

    let location = self.join(filename);
    if !location.is_file() {
      return Ok(cached);
    }
    let bytes = fs::read(&location).map_err(|e| StoreError::io(format!("reading {filename}"), e))?;
    let drv: Derivation = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
      filename: filename.to_string(),
      source,
    })?;
    let drv = drv.canonicalize();
    self.derivations.insert(drv.clone());
    debug!(filename, "loaded derivation");
    Ok(Some(drv))
  }

  /// Write the canonical JSON of `drv` to `{store}/{filename}`.
  pub fn write_derivation(&self, drv: &Derivation) -> Result<String, StoreError> {
    let drv = drv.clone().canonicalize();
    let filename = drv.filename();
    self.write_atomic(&filename, &drv.to_json())?;
    self.derivations.insert(drv);
    Ok(filename)
  }

  /// The recorded outputs of `drv` and whether every one of them is set.
  pub fn check_for_built_derivation_outputs(&self, drv: &Derivation) -> Result<(Vec<Output>, bool), StoreError> {
    match self.load_derivation(&drv.filename())? {
      Some(existing) => {
        let built = !existing.missing_output();
        Ok((existing.outputs, built))
      }
      None => Ok((Vec::new(), false)),
    }
  }

  /// True if every output's directory is present.
  pub fn output_folders_exist(&self, outputs: &[Output]) -> Result<bool, StoreError> {
    for output in outputs {
      match fs::metadata(self.join(&output.path)) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(format!("checking output {}", output.path), e)),
      }
    }
    Ok(true)
  }

  /// Validate options into a derivation, attaching outputs if it's
  /// already built. Returns whether it was.
  pub fn new_derivation(&self, options: NewDerivationOptions) -> Result<(bool, Derivation), StoreError> {
    let mut drv = options.into_derivation()?;
    let (outputs, built) = self.check_for_built_derivation_outputs(&drv)?;
    drv.outputs = outputs;
    Ok((built, drv))
  }

  /// Record a project location in the config registry.
  pub fn write_config_link(&self, location: &Path) -> Result<(), StoreError> {
    let location = location.to_string_lossy();
    let path = self.var_dir().join("config-registry").join(hash_string(&location));
    fs::write(&path, location.as_bytes()).map_err(|e| StoreError::io("writing config link", e))
  }

  /// Store the bytes of `src` under their content hash.
  pub fn write_blob(&self, mut src: impl Read) -> Result<String, StoreError> {
    let (mut file, tmp) = self.temp_file()?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let result = (|| -> io::Result<()> {
      loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
          break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
      }
      file.sync_all()
    })();
    drop(file);
    if let Err(e) = result {
      let _ = fs::remove_file(&tmp);
      return Err(StoreError::io("writing blob", e));
    }

    let hash = hasher.finish();
    let dst = self.join(&hash);
    if path_exists(&dst) {
      let _ = fs::remove_file(&tmp);
    } else {
      fs::rename(&tmp, &dst).map_err(|e| StoreError::io("moving blob into store", e))?;
    }
    Ok(hash)
  }

  /// Copy project files into the store as a content-addressed source
  /// bundle. Returns `None` when there are no files.
  pub fn store_local_sources(&self, sources: &SourceFiles) -> Result<Option<Source>, StoreError> {
    if sources.files.is_empty() {
      return Ok(None);
    }
    let tmp = self.temp_dir()?;
    let result = self.bundle_sources(sources, &tmp);
    if tmp.exists() {
      let _ = fs::remove_dir_all(&tmp);
    }
    result.map(Some)
  }

  fn bundle_sources(&self, sources: &SourceFiles, tmp: &Path) -> Result<Source, StoreError> {
    let abs_dir = sources.project_location.join(&sources.location);
    let mut files: Vec<PathBuf> = sources.files.iter().map(|f| sources.project_location.join(f)).collect();

    files.push(abs_dir.clone());
    let prefix = common_path_prefix(&files);
    files.pop();

    let relative = abs_dir
      .strip_prefix(&prefix)
      .map_err(|_| StoreError::io("locating build directory", io::ErrorKind::InvalidInput.into()))?
      .to_path_buf();

    copy_files_by_path(&prefix, &files, tmp)
      .map_err(|e| StoreError::io("copying files from source into temp folder", e))?;
    // the run location may hold none of the files
    fs::create_dir_all(tmp.join(&relative)).map_err(|e| StoreError::io("creating run location", e))?;

    let hash = normalize::archive(tmp, Hasher::new())?.finish();
    let dst = self.join(&hash);
    if !dst.exists() {
      fs::rename(tmp, &dst).map_err(|e| StoreError::io("moving sources into store", e))?;
    }
    Ok(Source {
      path: hash,
      relative_build_path: relative.to_string_lossy().into_owned(),
    })
  }

  /// Run `opts.args` with the main output of a built derivation on `PATH`.
  pub async fn run_derivation(
    &self,
    drv: &Derivation,
    opts: RunDerivationOptions,
    sandbox: &dyn Sandbox,
    cancel: &CancellationToken,
  ) -> Result<(), StoreError> {
    let main = drv
      .output(drv.main_output())
      .ok_or_else(|| StoreError::NotBuilt(drv.filename()))?;
    let rendered = drv.render(&self.store_path_str)?;

    let mut env = rendered.env;
    let bin = format!("{}/{}/bin", self.store_path_str, main.path);
    let path = match env.get("PATH") {
      Some(existing) if !existing.is_empty() => format!("{bin}:{existing}"),
      _ => bin,
    };
    env.insert("PATH".to_string(), path);

    let mut mounts = vec![Mount::read_only(&self.store_path)];
    mounts.extend(opts.mounts);

    let run = RunOptions {
      args: opts.args,
      env,
      dir: opts.dir,
      mounts,
      network: opts.network,
      stdin: opts.stdin,
      stdout: opts.stdout,
      stderr: opts.stderr,
      hidden_paths: opts.hidden_paths,
      read_only_paths: opts.read_only_paths,
      interactive: opts.interactive,
    };
    sandbox.run(run, cancel).await?;
    Ok(())
  }

  fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
    let (mut file, tmp) = self.temp_file()?;
    let written = file.write_all(data).and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = written {
      let _ = fs::remove_file(&tmp);
      return Err(StoreError::io(format!("writing {name}"), e));
    }
    fs::rename(&tmp, self.join(name)).map_err(|e| StoreError::io(format!("moving {name} into store"), e))
  }
}

/// Drop `.` components and trailing slashes so padding is computed on a
/// stable string.
fn clean(path: &Path) -> PathBuf {
  path.components().filter(|c| *c != Component::CurDir).collect()
}

#[cfg(unix)]
fn link_store(target: &str, link: &Path) -> Result<(), StoreError> {
  std::os::unix::fs::symlink(target, link).map_err(|e| StoreError::io("linking store directory", e))
}

#[cfg(not(unix))]
fn link_store(_target: &str, _link: &Path) -> Result<(), StoreError> {
  Ok(())
}
