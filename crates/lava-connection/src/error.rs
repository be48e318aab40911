use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
  /// No pattern matched before the deadline.
  #[error("timed out after {timeout:?} waiting for {expected}")]
  Timeout { timeout: Duration, expected: String },

  /// The other end closed the stream.
  #[error("connection closed")]
  Eof,

  /// The wait was interrupted by the job's cancellation token.
  #[error("wait cancelled")]
  Cancelled,

  /// The console command could not be started.
  #[error("failed to spawn console command '{command}': {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
