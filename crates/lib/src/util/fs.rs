//! Filesystem helpers used by the store and the builder.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Recursively copy the contents of `src` into `dst`.
///
/// `dst` must exist. Symlinks are recreated, not followed; file permissions
/// are preserved.
pub fn copy_directory(src: &Path, dst: &Path) -> io::Result<()> {
  for entry in WalkDir::new(src).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dst.join(rel);
    copy_entry(entry.path(), &target, entry.file_type())?;
  }
  Ok(())
}

/// Copy `files` (absolute paths under `prefix`) into `dst`, keeping their
/// layout relative to `prefix`. Directories are copied recursively.
pub fn copy_files_by_path(prefix: &Path, files: &[PathBuf], dst: &Path) -> io::Result<()> {
  for file in files {
    let rel = file.strip_prefix(prefix).map_err(|_| {
      io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is not under {}", file.display(), prefix.display()),
      )
    })?;
    let target = dst.join(rel);
    let meta = fs::symlink_metadata(file)?;
    if meta.is_dir() {
      fs::create_dir_all(&target)?;
      copy_directory(file, &target)?;
    } else {
      copy_entry(file, &target, meta.file_type())?;
    }
  }
  Ok(())
}

fn copy_entry(src: &Path, target: &Path, file_type: fs::FileType) -> io::Result<()> {
  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent)?;
  }
  if file_type.is_dir() {
    fs::create_dir_all(target)?;
    fs::set_permissions(target, fs::metadata(src)?.permissions())?;
  } else if file_type.is_symlink() {
    let link = fs::read_link(src)?;
    symlink(&link, target)?;
  } else {
    fs::copy(src, target)?;
  }
  Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(original, link)
}

/// Longest directory prefix shared by every path.
pub fn common_path_prefix(paths: &[PathBuf]) -> PathBuf {
  let mut iter = paths.iter();
  let Some(first) = iter.next() else {
    return PathBuf::new();
  };
  let mut prefix: Vec<Component<'_>> = first.components().collect();
  for path in iter {
    let shared = prefix
      .iter()
      .zip(path.components())
      .take_while(|(a, b)| **a == *b)
      .count();
    prefix.truncate(shared);
  }
  prefix.iter().collect()
}

/// True if anything (including a dangling symlink) exists at `path`.
pub fn path_exists(path: &Path) -> bool {
  fs::symlink_metadata(path).is_ok()
}
