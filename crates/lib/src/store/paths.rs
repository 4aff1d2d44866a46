//! Bramble root resolution and the fixed-length store path scheme.
//!
//! Every installation keeps its store at a path of the same length, so that
//! store paths inside build outputs can be swapped byte-for-byte with the
//! prefix of record. The store directory is the bramble root plus a
//! padding suffix built from [`PATH_PADDING_CHARACTERS`].

use std::path::PathBuf;

use super::StoreError;
use crate::consts::{BRAMBLE_PATH_ENV, PATH_PADDING_CHARACTERS};

/// Home directory from `HOME` (or `USERPROFILE` on Windows).
#[cfg(not(windows))]
fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").filter(|h| !h.is_empty()).map(PathBuf::from)
}

/// The bramble root: `BRAMBLE_PATH` if set, else `~/bramble`.
pub fn bramble_path_from_env() -> Result<PathBuf, StoreError> {
  if let Some(path) = std::env::var_os(BRAMBLE_PATH_ENV).filter(|p| !p.is_empty()) {
    return Ok(PathBuf::from(path));
  }
  home_dir().map(|h| h.join("bramble")).ok_or(StoreError::NoHome)
}

/// Compute the padding suffix for `bramble_path`.
///
/// The result starts with `/` and satisfies
/// `bramble_path.len() + suffix.len() + 1 == padding_length`, i.e. the store
/// path plus a trailing slash is exactly `padding_length` bytes.
pub fn calculate_padded_directory_name(bramble_path: &str, padding_length: usize) -> Result<String, StoreError> {
  // parent path, slash before the directory, slash after it
  let budget = padding_length as isize - bramble_path.len() as isize - 2;
  if budget <= 0 {
    return Err(StoreError::PathTooLong {
      path: bramble_path.to_string(),
      target: padding_length,
    });
  }
  let budget = budget as usize;

  let token = PATH_PADDING_CHARACTERS;
  let repetitions = budget / (token.len() + 1);
  let extra = budget % (token.len() + 1);

  let mut name = String::with_capacity(budget + 1);
  for _ in 0..repetitions {
    name.push('/');
    name.push_str(token);
  }
  if extra == 0 {
    // A bare trailing "/" would leave the path one byte short, so extend the
    // last segment by one character instead.
    name.push_str(&token[..1]);
  } else {
    name.push('/');
    name.push_str(&token[..extra]);
  }
  Ok(name)
}
