//! Derivation data model and content addressing.
//!
//! A derivation's identity is the hash of its canonical JSON form:
//!
//! - empty collections are omitted, so "empty" and "unset" hash the same
//! - `outputs` never take part in the hash
//! - dependencies are sorted by `(filename, output_name)` and deduplicated
//! - a dependency whose output is already known is hashed without its
//!   producing derivation's filename
//!
//! The filename of a derivation on disk is `{hash}-{name}.drv`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::template::{Template, TemplateError};
use crate::consts::{BRAMBLE_PREFIX_OF_RECORD, DEFAULT_OUTPUT};
use crate::util::hash::hash_bytes;

fn is_false(b: &bool) -> bool {
  !*b
}

fn default_output_names() -> Vec<String> {
  vec![DEFAULT_OUTPUT.to_string()]
}

/// A built output of a derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Output {
  /// Content hash naming the output directory in the store.
  pub path: String,

  /// Runtime dependencies: content hashes of other outputs referenced by
  /// this output's bytes.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<String>,
}

impl Output {
  pub fn is_empty(&self) -> bool {
    self.path.is_empty() && self.dependencies.is_empty()
  }
}

/// A reference to output `output_name` of the derivation stored as `filename`.
///
/// Used both as a dependency entry and as a graph node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DerivationOutput {
  pub filename: String,
  pub output_name: String,

  /// Content hash of the output once it is built.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<String>,
}

impl DerivationOutput {
  pub fn new(filename: impl Into<String>, output_name: impl Into<String>) -> Self {
    Self {
      filename: filename.into(),
      output_name: output_name.into(),
      output: None,
    }
  }

  /// Synthetic node joining every output of a multi-output derivation.
  pub fn fake_root() -> Self {
    Self::new("fake-root", "")
  }
}

impl fmt::Display for DerivationOutput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.filename, self.output_name)
  }
}

/// Source files bundled into the store for a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
  /// Content hash of the source bundle in the store.
  pub path: String,

  /// Directory inside the bundle the builder runs from.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub relative_build_path: String,
}

/// A build recipe.
///
/// Field order is fixed; it defines the canonical JSON layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<Template>,

  /// A builtin name such as `basic_fetch_url`, or a path to an executable
  /// that is itself a build output.
  pub builder: Template,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<DerivationOutput>,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, Template>,

  pub name: String,

  #[serde(default, skip_serializing_if = "is_false")]
  pub network: bool,

  #[serde(default = "default_output_names")]
  pub output_names: Vec<String>,

  /// Parallel to `output_names`; empty until built. Not part of the hash.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub outputs: Vec<Output>,

  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub platform: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<Source>,
}

impl Default for Derivation {
  fn default() -> Self {
    Self {
      args: Vec::new(),
      builder: Template::default(),
      dependencies: Vec::new(),
      env: BTreeMap::new(),
      name: String::new(),
      network: false,
      output_names: default_output_names(),
      outputs: Vec::new(),
      platform: String::new(),
      source: None,
    }
  }
}

/// A derivation with every template rendered to a concrete string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDerivation {
  pub name: String,
  pub builder: String,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub network: bool,
  pub output_names: Vec<String>,
  pub source: Option<Source>,
}

impl RenderedDerivation {
  /// `KEY=value` pairs, sorted by key.
  pub fn env_pairs(&self) -> Vec<String> {
    self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
  }
}

impl Derivation {
  /// Sort and deduplicate dependencies, and drop empty placeholders so the
  /// value serializes identically however it was constructed.
  pub fn canonicalize(mut self) -> Self {
    // a resolved entry sorts ahead of an unresolved one for the same output
    // and is the one kept
    self.dependencies.sort_by(|a, b| {
      (&a.filename, &a.output_name, a.output.is_none(), &a.output).cmp(&(
        &b.filename,
        &b.output_name,
        b.output.is_none(),
        &b.output,
      ))
    });
    self
      .dependencies
      .dedup_by(|next, kept| next.filename == kept.filename && next.output_name == kept.output_name);
    if self.outputs.iter().all(Output::is_empty) {
      self.outputs.clear();
    }
    self.source = self.source.filter(|s| !s.path.is_empty());
    self
  }

  /// Canonical JSON bytes, outputs included.
  pub fn to_json(&self) -> Vec<u8> {
    // A struct of strings, maps and vectors with string keys always serializes.
    serde_json::to_vec(&self.clone().canonicalize()).unwrap_or_default()
  }

  pub fn to_pretty_json(&self) -> String {
    serde_json::to_string_pretty(&self.clone().canonicalize()).unwrap_or_default()
  }

  /// The content hash identifying this derivation.
  pub fn hash(&self) -> String {
    let mut copy = self.clone().canonicalize();
    copy.outputs.clear();
    for dep in &mut copy.dependencies {
      if dep.output.is_some() {
        dep.filename.clear();
      }
    }
    hash_bytes(&copy.to_json())
  }

  /// `{hash}-{name}.drv`
  pub fn filename(&self) -> String {
    format!("{}-{}.drv", self.hash(), self.name)
  }

  /// One reference per declared output.
  pub fn derivation_outputs(&self) -> Vec<DerivationOutput> {
    let filename = self.filename();
    self
      .output_names
      .iter()
      .map(|name| DerivationOutput::new(filename.clone(), name.clone()))
      .collect()
  }

  /// True unless every declared output has a path.
  pub fn missing_output(&self) -> bool {
    self.outputs.is_empty()
      || self.outputs.len() < self.output_names.len()
      || self.outputs.iter().any(|o| o.path.is_empty())
  }

  pub fn has_output(&self, name: &str) -> bool {
    self.output_names.iter().any(|o| o == name)
  }

  /// The built output named `name`, if any.
  pub fn output(&self, name: &str) -> Option<&Output> {
    let idx = self.output_names.iter().position(|o| o == name)?;
    self.outputs.get(idx).filter(|o| !o.path.is_empty())
  }

  /// `out` when declared, else the first declared output.
  pub fn main_output(&self) -> &str {
    if self.has_output(DEFAULT_OUTPUT) || self.output_names.is_empty() {
      return DEFAULT_OUTPUT;
    }
    &self.output_names[0]
  }

  /// Every pending reference in builder, args and env.
  pub fn pending_refs(&self) -> Vec<DerivationOutput> {
    let mut refs: Vec<DerivationOutput> = std::iter::once(&self.builder)
      .chain(self.args.iter())
      .chain(self.env.values())
      .flat_map(|t| t.pending_refs())
      .map(|(filename, output)| DerivationOutput::new(filename, output))
      .collect();
    refs.sort();
    refs.dedup();
    refs
  }

  /// Resolve pending references in one pass over builder, args, env and
  /// the dependency list. `lookup` maps `(filename, output)` to a content
  /// hash when that output is built.
  pub fn resolve<F>(&mut self, lookup: F) -> usize
  where
    F: Fn(&str, &str) -> Option<String>,
  {
    let mut count = self.builder.resolve(&lookup);
    for arg in &mut self.args {
      count += arg.resolve(&lookup);
    }
    for value in self.env.values_mut() {
      count += value.resolve(&lookup);
    }
    for dep in &mut self.dependencies {
      if dep.output.is_none() {
        dep.output = lookup(&dep.filename, &dep.output_name);
      }
    }
    count
  }

  /// Render every template with outputs under `store_path`.
  pub fn render(&self, store_path: &str) -> Result<RenderedDerivation, TemplateError> {
    let env = self
      .env
      .iter()
      .map(|(k, v)| Ok((k.clone(), v.render(store_path)?)))
      .collect::<Result<BTreeMap<_, _>, TemplateError>>()?;
    Ok(RenderedDerivation {
      name: self.name.clone(),
      builder: self.builder.render(store_path)?,
      args: self
        .args
        .iter()
        .map(|a| a.render(store_path))
        .collect::<Result<_, _>>()?,
      env,
      network: self.network,
      output_names: self.output_names.clone(),
      source: self.source.clone(),
    })
  }

  /// Rewrite `{store_path}/{filename}` occurrences of each dependency in
  /// literal text to the prefix of record, so the derivation carries no
  /// trace of the local install root.
  pub fn normalized(&self, store_path: &str) -> Derivation {
    let pairs: Vec<(String, String)> = self
      .dependencies
      .iter()
      .flat_map(|dep| {
        let mut pairs = vec![(
          format!("{store_path}/{}", dep.filename),
          format!("{BRAMBLE_PREFIX_OF_RECORD}/{}", dep.filename),
        )];
        if let Some(output) = &dep.output {
          pairs.push((
            format!("{store_path}/{output}"),
            format!("{BRAMBLE_PREFIX_OF_RECORD}/{output}"),
          ));
        }
        pairs
      })
      .collect();
    self.map_text(|s| {
      pairs
        .iter()
        .fold(s.to_string(), |acc, (from, to)| acc.replace(from, to))
    })
  }

  /// Inverse of [`Derivation::normalized`] for outputs present locally.
  pub fn localized(&self, store_path: &str, exists: impl Fn(&str) -> bool) -> Derivation {
    let prefix = format!("{BRAMBLE_PREFIX_OF_RECORD}/");
    self.map_text(|s| {
      let mut out = String::with_capacity(s.len());
      let mut rest = s;
      while let Some(idx) = rest.find(&prefix) {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + prefix.len()..];
        let hash: String = after.chars().take(crate::consts::HASH_LEN).collect();
        if crate::util::hash::is_store_hash(&hash) && exists(&hash) {
          out.push_str(store_path);
          out.push('/');
        } else {
          out.push_str(&prefix);
        }
        rest = after;
      }
      out.push_str(rest);
      out
    })
  }

  fn map_text<F>(&self, f: F) -> Derivation
  where
    F: Fn(&str) -> String,
  {
    let mut copy = self.clone();
    copy.builder.map_text(&f);
    for arg in &mut copy.args {
      arg.map_text(&f);
    }
    for value in copy.env.values_mut() {
      value.map_text(&f);
    }
    copy
  }
}
