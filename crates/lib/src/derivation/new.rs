//! Constructing derivations from frontend options.

use std::collections::{BTreeMap, HashSet};

use super::DerivationError;
use super::template::Template;
use super::types::{Derivation, DerivationOutput, Source};
use crate::consts::DEFAULT_OUTPUT;

/// Everything a frontend supplies to describe a build.
#[derive(Debug, Clone, Default)]
pub struct NewDerivationOptions {
  pub args: Vec<Template>,
  pub builder: Template,
  pub env: BTreeMap<String, Template>,
  pub input_derivations: Vec<DerivationOutput>,
  pub name: String,
  /// Output names; defaults to `["out"]` when empty.
  pub outputs: Vec<String>,
  pub platform: String,
  pub source: Option<Source>,
  pub network: bool,
}

impl NewDerivationOptions {
  /// Validate and turn the options into a canonical derivation.
  pub fn into_derivation(self) -> Result<Derivation, DerivationError> {
    if self.name.is_empty() {
      return Err(DerivationError::Validation("derivation name must not be empty".to_string()));
    }
    if self.name.contains('/') {
      return Err(DerivationError::Validation(format!(
        "derivation name {:?} must not contain '/'",
        self.name
      )));
    }
    if self.builder.is_empty() {
      return Err(DerivationError::Validation(format!(
        "derivation {:?} has no builder",
        self.name
      )));
    }

    let output_names = if self.outputs.is_empty() {
      vec![DEFAULT_OUTPUT.to_string()]
    } else {
      self.outputs
    };
    let mut seen = HashSet::new();
    for name in &output_names {
      if name.is_empty() {
        return Err(DerivationError::Validation(format!(
          "derivation {:?} has an empty output name",
          self.name
        )));
      }
      if !seen.insert(name.as_str()) {
        return Err(DerivationError::Validation(format!(
          "derivation {:?} declares output {name:?} twice",
          self.name
        )));
      }
    }

    let mut dependencies = self.input_derivations;
    for t in std::iter::once(&self.builder)
      .chain(self.args.iter())
      .chain(self.env.values())
    {
      for (filename, output) in t.pending_refs() {
        dependencies.push(DerivationOutput::new(filename, output));
      }
    }

    Ok(
      Derivation {
        args: self.args,
        builder: self.builder,
        dependencies,
        env: self.env,
        name: self.name,
        network: self.network,
        output_names,
        outputs: Vec::new(),
        platform: self.platform,
        source: self.source,
      }
      .canonicalize(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn options() -> NewDerivationOptions {
    NewDerivationOptions {
      name: "hello".to_string(),
      builder: Template::text("/bin/sh"),
      ..Default::default()
    }
  }

  #[test]
  fn defaults_to_out_output() {
    let drv = options().into_derivation().unwrap();
    assert_eq!(drv.output_names, vec!["out"]);
  }

  #[test]
  fn rejects_empty_name() {
    let err = NewDerivationOptions {
      name: String::new(),
      ..options()
    }
    .into_derivation()
    .unwrap_err();
    assert!(matches!(err, DerivationError::Validation(_)));
  }

  #[test]
  fn rejects_duplicate_outputs() {
    let err = NewDerivationOptions {
      outputs: vec!["out".to_string(), "out".to_string()],
      ..options()
    }
    .into_derivation()
    .unwrap_err();
    assert!(err.to_string().contains("twice"), "{err}");
  }

  #[test]
  fn rejects_missing_builder() {
    let err = NewDerivationOptions {
      builder: Template::default(),
      ..options()
    }
    .into_derivation()
    .unwrap_err();
    assert!(err.to_string().contains("no builder"), "{err}");
  }

  #[test]
  fn template_references_become_dependencies() {
    let drv = NewDerivationOptions {
      args: vec![Template::pending("aaaa-dep.drv", "out").join(Template::text("/bin/tool"))],
      ..options()
    }
    .into_derivation()
    .unwrap();
    assert_eq!(drv.dependencies, vec![DerivationOutput::new("aaaa-dep.drv", "out")]);
  }
}
