//! Lava Results
//!
//! What a finished job leaves behind: a [`ResultBundle`] with every test
//! result grouped into test runs, and the job log.
//!
//! The [`BundleStore`] trait is the storage backend. [`FsBundleStore`]
//! keeps each job under `{base_path}/{job_id}/` next to its log, which
//! [`LogTail`] can follow by byte offset while the job runs.

mod bundle;
mod fs;
mod tail;

pub use bundle::{ResultBundle, TestRun};
pub use fs::FsBundleStore;
pub use tail::{LogChunk, LogTail};

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// A boxed stream of bytes for log data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BundleError>> + Send>>;

/// Error type for result storage operations.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
  /// No bundle or log exists for the job.
  #[error("no results for job {0}")]
  NotFound(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid bundle: {0}")]
  Format(#[from] serde_json::Error),
}

/// Result storage trait.
#[async_trait]
pub trait BundleStore: Send + Sync {
  /// Store the bundle of a job, replacing any earlier one.
  async fn put(&self, bundle: &ResultBundle) -> Result<(), BundleError>;

  async fn get(&self, job_id: &str) -> Result<ResultBundle, BundleError>;

  /// The job log as a stream.
  async fn log(&self, job_id: &str) -> Result<ByteStream, BundleError>;

  /// Remove everything stored for a job.
  async fn delete(&self, job_id: &str) -> Result<(), BundleError>;
}
