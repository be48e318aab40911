//! Error taxonomy for job execution.

use std::time::Duration;

use lava_connection::ConnectionError;
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Errors that can end a job.
///
/// Validation errors are collected before anything runs. The remaining
/// variants are raised while the pipeline runs and unwind every enclosing
/// pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LavaError {
  /// Parameters, schema or strategy selection problems.
  #[error("validation failed: {}", errors.join("; "))]
  Validation { errors: Vec<String> },

  /// The dispatcher or the device could not do its part: connection lost,
  /// fetch failed, missing capability.
  #[error("infrastructure error: {message}")]
  Infrastructure { message: String },

  /// A problem with what the job asked for, e.g. a malformed test definition.
  #[error("job error: {message}")]
  Job { message: String },

  /// An action or a wait ran out of time.
  #[error("timeout: {message}")]
  Timeout { message: String },

  /// The job was cancelled.
  #[error("job cancelled")]
  Cancelled,
}

impl LavaError {
  pub fn validation(errors: Vec<String>) -> Self {
    Self::Validation { errors }
  }

  pub fn infrastructure(message: impl Into<String>) -> Self {
    Self::Infrastructure {
      message: message.into(),
    }
  }

  pub fn job(message: impl Into<String>) -> Self {
    Self::Job {
      message: message.into(),
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::Timeout {
      message: message.into(),
    }
  }

  /// Timeout raised when an action exceeds its own budget.
  pub fn action_timeout(name: &str, limit: Duration) -> Self {
    Self::timeout(format!("{name} timed out after {}s", limit.as_secs()))
  }

  /// Timeout raised when the whole job runs out of time.
  pub fn job_timeout(limit: Duration) -> Self {
    Self::timeout(format!("job timed out after {}s", limit.as_secs()))
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      LavaError::Validation { .. } => ErrorKind::Validation,
      LavaError::Infrastructure { .. } => ErrorKind::Infrastructure,
      LavaError::Job { .. } => ErrorKind::Job,
      LavaError::Timeout { .. } => ErrorKind::Timeout,
      LavaError::Cancelled => ErrorKind::Cancelled,
    }
  }

  /// The final job status this error leads to.
  pub fn status(&self) -> JobStatus {
    match self {
      LavaError::Cancelled => JobStatus::Canceled,
      _ => JobStatus::Incomplete,
    }
  }
}

impl From<ConnectionError> for LavaError {
  fn from(err: ConnectionError) -> Self {
    match err {
      ConnectionError::Cancelled => LavaError::Cancelled,
      ConnectionError::Timeout { .. } => LavaError::timeout(err.to_string()),
      other => LavaError::infrastructure(other.to_string()),
    }
  }
}

/// Error class as recorded in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Validation,
  Infrastructure,
  Job,
  Timeout,
  Cancelled,
}
