//! Templated strings with explicit references to other derivations' outputs.
//!
//! A derivation's builder, args and env values may point at the output of a
//! dependency. Instead of embedding a magic marker inside a string, each such
//! value is a [`Template`]: a sequence of literal text and typed references.
//!
//! - [`Part::Pending`] names an output that hasn't been built yet by the
//!   filename of the derivation that produces it.
//! - [`Part::Resolved`] carries the output's content hash once it exists.
//!
//! Resolution is a single pass over the derivation ([`Template::resolve`]),
//! and rendering ([`Template::render`]) turns resolved parts into absolute
//! store paths just before execution.
//!
//! # Serialization
//!
//! A template made only of text serializes as a plain JSON string, so the
//! common case stays readable:
//!
//! ```
//! use bramble_lib::derivation::{Part, Template};
//!
//! let plain: Template = serde_json::from_str(r#""hello""#).unwrap();
//! assert_eq!(plain, Template::text("hello"));
//!
//! let t = Template::from_parts(vec![
//!   Part::Resolved { path: "abc".to_string() },
//!   Part::Text("/bin/sh".to_string()),
//! ]);
//! assert_eq!(
//!   serde_json::to_string(&t).unwrap(),
//!   r#"[{"resolved":{"path":"abc"}},{"text":"/bin/sh"}]"#
//! );
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One piece of a [`Template`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
  /// Literal text.
  Text(String),

  /// Output `output` of the derivation stored as `filename`, not built yet.
  Pending { filename: String, output: String },

  /// A built output, by content hash (store-relative).
  Resolved { path: String },
}

/// Errors raised while rendering templates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
  #[error("unresolved reference to output '{output}' of {filename}")]
  Unresolved { filename: String, output: String },
}

/// A string that may reference other derivations' outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "TemplateRepr", into = "TemplateRepr")]
pub struct Template(Vec<Part>);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TemplateRepr {
  Plain(String),
  Parts(Vec<Part>),
}

impl From<TemplateRepr> for Template {
  fn from(repr: TemplateRepr) -> Self {
    match repr {
      TemplateRepr::Plain(s) => Template::text(s),
      TemplateRepr::Parts(parts) => Template::from_parts(parts),
    }
  }
}

impl From<Template> for TemplateRepr {
  fn from(t: Template) -> Self {
    match t.0.as_slice() {
      [] => TemplateRepr::Plain(String::new()),
      [Part::Text(s)] => TemplateRepr::Plain(s.clone()),
      _ => TemplateRepr::Parts(t.0),
    }
  }
}

impl From<&str> for Template {
  fn from(s: &str) -> Self {
    Template::text(s)
  }
}

impl From<String> for Template {
  fn from(s: String) -> Self {
    Template::text(s)
  }
}

impl Template {
  /// A template holding only literal text.
  pub fn text(s: impl Into<String>) -> Self {
    Self::from_parts(vec![Part::Text(s.into())])
  }

  /// A template referencing output `output` of derivation `filename`.
  pub fn pending(filename: impl Into<String>, output: impl Into<String>) -> Self {
    Self(vec![Part::Pending {
      filename: filename.into(),
      output: output.into(),
    }])
  }

  /// Build a template, merging adjacent text and dropping empty text so
  /// equal templates always have equal parts.
  pub fn from_parts(parts: Vec<Part>) -> Self {
    let mut out: Vec<Part> = Vec::with_capacity(parts.len());
    for part in parts {
      match part {
        Part::Text(s) if s.is_empty() => {}
        Part::Text(s) => match out.last_mut() {
          Some(Part::Text(prev)) => prev.push_str(&s),
          _ => out.push(Part::Text(s)),
        },
        other => out.push(other),
      }
    }
    Self(out)
  }

  /// Append another template.
  pub fn join(mut self, other: Template) -> Self {
    self.0.extend(other.0);
    Self::from_parts(self.0)
  }

  pub fn parts(&self) -> &[Part] {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// The literal value, if the template has no references.
  pub fn as_text(&self) -> Option<&str> {
    match self.0.as_slice() {
      [] => Some(""),
      [Part::Text(s)] => Some(s),
      _ => None,
    }
  }

  /// Pending references, in order.
  pub fn pending_refs(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().filter_map(|p| match p {
      Part::Pending { filename, output } => Some((filename.as_str(), output.as_str())),
      _ => None,
    })
  }

  /// Replace pending references that `lookup` can answer with resolved ones.
  ///
  /// `lookup` maps `(filename, output)` to the output's content hash.
  /// Returns the number of parts resolved.
  pub fn resolve<F>(&mut self, lookup: &F) -> usize
  where
    F: Fn(&str, &str) -> Option<String>,
  {
    let mut count = 0;
    for part in &mut self.0 {
      if let Part::Pending { filename, output } = part
        && let Some(path) = lookup(filename, output)
      {
        *part = Part::Resolved { path };
        count += 1;
      }
    }
    count
  }

  /// Render to a concrete string, placing resolved outputs under `store_path`.
  pub fn render(&self, store_path: &str) -> Result<String, TemplateError> {
    let mut out = String::new();
    for part in &self.0 {
      match part {
        Part::Text(s) => out.push_str(s),
        Part::Resolved { path } => {
          out.push_str(store_path);
          out.push('/');
          out.push_str(path);
        }
        Part::Pending { filename, output } => {
          return Err(TemplateError::Unresolved {
            filename: filename.clone(),
            output: output.clone(),
          });
        }
      }
    }
    Ok(out)
  }

  /// Apply `f` to every literal text part.
  pub(crate) fn map_text<F>(&mut self, f: F)
  where
    F: Fn(&str) -> String,
  {
    for part in &mut self.0 {
      if let Part::Text(s) = part {
        *s = f(s);
      }
    }
  }
}

impl fmt::Display for Template {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for part in &self.0 {
      match part {
        Part::Text(s) => write!(f, "{s}")?,
        Part::Pending { filename, output } => write!(f, "<{filename}:{output}>")?,
        Part::Resolved { path } => write!(f, "<{path}>")?,
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  mod construction {
    use super::*;

    #[test]
    fn adjacent_text_is_merged() {
      let t = Template::from_parts(vec![
        Part::Text("a".to_string()),
        Part::Text(String::new()),
        Part::Text("b".to_string()),
      ]);
      assert_eq!(t.parts(), &[Part::Text("ab".to_string())]);
    }

    #[test]
    fn join_merges_text_boundaries() {
      let t = Template::text("PATH=").join(Template::text("/bin"));
      assert_eq!(t.as_text(), Some("PATH=/bin"));
    }

    #[test]
    fn pending_refs_lists_references() {
      let t = Template::pending("abc-dep.drv", "out").join(Template::text("/bin"));
      assert_eq!(t.pending_refs().collect::<Vec<_>>(), vec![("abc-dep.drv", "out")]);
    }
  }

  mod serde_form {
    use super::*;

    #[test]
    fn text_only_is_plain_string() {
      let t = Template::text("hello world");
      assert_eq!(serde_json::to_string(&t).unwrap(), r#""hello world""#);
    }

    #[test]
    fn empty_is_empty_string() {
      assert_eq!(serde_json::to_string(&Template::default()).unwrap(), r#""""#);
      let t: Template = serde_json::from_str(r#""""#).unwrap();
      assert!(t.is_empty());
    }

    #[test]
    fn references_are_tagged_objects() {
      let t = Template::pending("abc-dep.drv", "out").join(Template::text("/bin/sh"));
      let json = serde_json::to_string(&t).unwrap();
      assert_eq!(
        json,
        r#"[{"pending":{"filename":"abc-dep.drv","output":"out"}},{"text":"/bin/sh"}]"#
      );
      let back: Template = serde_json::from_str(&json).unwrap();
      assert_eq!(back, t);
    }

    #[test]
    fn template_shaped_text_stays_text() {
      // user text that looks like a reference is never interpreted
      let t: Template = serde_json::from_str(r#""{{ abc-dep.drv:out }}""#).unwrap();
      assert_eq!(t.pending_refs().count(), 0);
      assert_eq!(t.render("/store").unwrap(), "{{ abc-dep.drv:out }}");
    }
  }

  mod resolution {
    use super::*;

    #[test]
    fn resolve_replaces_known_refs_only() {
      let mut t = Template::pending("a.drv", "out")
        .join(Template::text(":"))
        .join(Template::pending("b.drv", "out"));
      let n = t.resolve(&|f: &str, _: &str| (f == "a.drv").then(|| "hash_a".to_string()));
      assert_eq!(n, 1);
      assert_eq!(t.pending_refs().collect::<Vec<_>>(), vec![("b.drv", "out")]);
    }

    #[test]
    fn render_places_outputs_under_store() {
      let t = Template::from_parts(vec![
        Part::Resolved { path: "hash_a".to_string() },
        Part::Text("/bin/sh".to_string()),
      ]);
      assert_eq!(t.render("/b/store").unwrap(), "/b/store/hash_a/bin/sh");
    }

    #[test]
    fn render_rejects_pending() {
      let t = Template::pending("a.drv", "dev");
      assert_eq!(
        t.render("/store"),
        Err(TemplateError::Unresolved {
          filename: "a.drv".to_string(),
          output: "dev".to_string()
        })
      );
    }
  }
}
