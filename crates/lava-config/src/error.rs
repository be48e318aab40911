use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configuration documents.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {what}: {message}")]
  Parse { what: String, message: String },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

impl ConfigError {
  pub(crate) fn parse(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
    Self::Parse {
      what: what.into(),
      message: err.to_string(),
    }
  }
}
