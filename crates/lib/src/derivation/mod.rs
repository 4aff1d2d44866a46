//! Derivations: immutable build recipes identified by the hash of their
//! canonical form.

mod new;
mod template;
mod types;

use thiserror::Error;

pub use new::NewDerivationOptions;
pub use template::{Part, Template, TemplateError};
pub use types::{Derivation, DerivationOutput, Output, RenderedDerivation, Source};

/// Errors raised while constructing derivations.
#[derive(Debug, Error)]
pub enum DerivationError {
  /// Malformed options from the frontend.
  #[error("invalid derivation: {0}")]
  Validation(String),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error("failed to parse derivation: {0}")]
  Parse(#[from] serde_json::Error),
}
