use std::path::PathBuf;
use std::time::Duration;

use lava_pipeline::LavaError;
use thiserror::Error;

/// Errors raised while fetching test content.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("'{command}' failed with {status}: {stderr}")]
  Command {
    command: String,
    status: String,
    stderr: String,
  },

  #[error("fetching {locator} timed out after {}s", timeout.as_secs())]
  Timeout { locator: String, timeout: Duration },

  #[error("download of {url} failed: {message}")]
  Http { url: String, message: String },

  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  Checksum {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("unsupported locator: {0}")]
  Unsupported(String),

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl FetchError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}

/// Errors raised while loading or materializing a test definition.
#[derive(Debug, Error)]
pub enum LoadError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("invalid test definition {what}: {message}")]
  Parse { what: String, message: String },

  #[error("invalid test definition locator: {0}")]
  Locator(String),

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl LoadError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}

impl From<FetchError> for LavaError {
  fn from(err: FetchError) -> Self {
    LavaError::infrastructure(err.to_string())
  }
}

impl From<LoadError> for LavaError {
  fn from(err: LoadError) -> Self {
    match err {
      LoadError::Parse { .. } | LoadError::Locator(_) => LavaError::job(err.to_string()),
      other => LavaError::infrastructure(other.to_string()),
    }
  }
}
