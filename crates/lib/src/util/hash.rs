//! Hashing utilities for content-addressed storage.
//!
//! Every identity in the store (derivation hashes, output directory names,
//! source bundles, blobs) is the lowercase base32 encoding of the first 20
//! bytes of a SHA-256 digest: 32 characters, no padding.

use std::io;

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a store hash.
const TRUNCATED_DIGEST_LEN: usize = 20;

/// Streaming hasher producing store hashes.
///
/// Implements [`io::Write`] so it can sit at the end of a copy.
#[derive(Clone, Default)]
pub struct Hasher {
  inner: Sha256,
}

impl Hasher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(&mut self, data: &[u8]) {
    self.inner.update(data);
  }

  /// Finish and return the 32-character store hash.
  pub fn finish(self) -> String {
    bytes_to_base32_hash(&self.inner.finalize())
  }

  /// Finish and return the full SHA-256 as lowercase hex.
  pub fn finish_hex(self) -> String {
    hex::encode(self.inner.finalize())
  }
}

impl io::Write for Hasher {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.inner.update(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// Lowercase base32 of the first 160 bits of a digest.
pub fn bytes_to_base32_hash(digest: &[u8]) -> String {
  let len = digest.len().min(TRUNCATED_DIGEST_LEN);
  BASE32_NOPAD.encode(&digest[..len]).to_lowercase()
}

/// Hash a string.
pub fn hash_string(input: &str) -> String {
  hash_bytes(input.as_bytes())
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Hasher::new();
  hasher.update(data);
  hasher.finish()
}

/// True when `value` looks like a store hash.
pub fn is_store_hash(value: &str) -> bool {
  value.len() == crate::consts::HASH_LEN && value.bytes().all(|b| matches!(b, b'a'..=b'z' | b'2'..=b'7'))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn hash_is_32_lowercase_chars() {
    let hash = hash_string("hello");
    assert_eq!(hash.len(), 32);
    assert!(is_store_hash(&hash), "{hash}");
  }

  #[test]
  fn hash_is_deterministic() {
    assert_eq!(hash_string("content"), hash_string("content"));
    assert_ne!(hash_string("content a"), hash_string("content b"));
  }

  #[test]
  fn streaming_matches_one_shot() {
    let mut hasher = Hasher::new();
    hasher.write_all(b"hello ").unwrap();
    hasher.write_all(b"world").unwrap();
    assert_eq!(hasher.finish(), hash_bytes(b"hello world"));
  }

  #[test]
  fn empty_input_hash() {
    // sha256("") starts e3b0c442 98fc1c14 ...; base32 of the first 20 bytes
    assert_eq!(hash_bytes(b""), "4oymiquy7qobjgx36tejs35zeqt24qpe");
  }

  #[test]
  fn known_vector() {
    // sha256("abc") = ba7816bf 8f01cfea ...
    assert_eq!(hash_bytes(b"abc"), "xj4bnp4pahh6uqkbidpf3lrceoyagynd");
  }

  #[test]
  fn hex_is_full_digest() {
    let mut hasher = Hasher::new();
    hasher.update(b"");
    assert_eq!(
      hasher.finish_hex(),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }

  #[test]
  fn rejects_non_hashes() {
    assert!(!is_store_hash("short"));
    assert!(!is_store_hash("bramble_build_directory123456789"));
  }
}
