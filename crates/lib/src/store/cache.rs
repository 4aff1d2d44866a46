//! In-memory derivation cache keyed by filename.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::derivation::Derivation;

#[derive(Debug, Default)]
pub struct DerivationCache {
  inner: RwLock<HashMap<String, Derivation>>,
}

impl DerivationCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, filename: &str) -> Option<Derivation> {
    let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
    map.get(filename).cloned()
  }

  pub fn contains(&self, filename: &str) -> bool {
    let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
    map.contains_key(filename)
  }

  /// Insert under the derivation's own filename, replacing any entry.
  pub fn insert(&self, drv: Derivation) -> String {
    let filename = drv.filename();
    let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
    map.insert(filename.clone(), drv);
    filename
  }

  pub fn len(&self) -> usize {
    self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
