use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::{BundleError, BundleStore, ByteStream, ResultBundle};

const BUNDLE_FILE: &str = "bundle.json";
const LOG_FILE: &str = "job.log";

/// Filesystem-based result store.
///
/// Each job gets `{base_path}/{job_id}/` holding `bundle.json` and the
/// JSON-lines job log `job.log`.
pub struct FsBundleStore {
  base_path: PathBuf,
}

impl FsBundleStore {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  pub fn job_dir(&self, job_id: &str) -> PathBuf {
    self.base_path.join(job_id)
  }

  /// Where the job log is written while the job runs.
  pub fn log_path(&self, job_id: &str) -> PathBuf {
    self.job_dir(job_id).join(LOG_FILE)
  }

  fn bundle_path(&self, job_id: &str) -> PathBuf {
    self.job_dir(job_id).join(BUNDLE_FILE)
  }
}

fn not_found(job_id: &str) -> impl FnOnce(std::io::Error) -> BundleError + '_ {
  move |e| {
    if e.kind() == std::io::ErrorKind::NotFound {
      BundleError::NotFound(job_id.to_string())
    } else {
      BundleError::Io(e)
    }
  }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), BundleError> {
  let partial = path.with_extension("json.partial");
  let mut file = File::create(&partial).await?;
  file.write_all(content).await?;
  file.flush().await?;
  fs::rename(&partial, path).await?;
  Ok(())
}

#[async_trait]
impl BundleStore for FsBundleStore {
  async fn put(&self, bundle: &ResultBundle) -> Result<(), BundleError> {
    let dir = self.job_dir(&bundle.job_id);
    fs::create_dir_all(&dir).await?;
    let content = serde_json::to_vec_pretty(bundle)?;
    let path = self.bundle_path(&bundle.job_id);
    write_atomic(&path, &content).await?;
    info!(
      job_id = %bundle.job_id,
      path = %path.display(),
      results = bundle.result_count(),
      "bundle_stored"
    );
    Ok(())
  }

  async fn get(&self, job_id: &str) -> Result<ResultBundle, BundleError> {
    let content = fs::read(self.bundle_path(job_id))
      .await
      .map_err(not_found(job_id))?;
    Ok(serde_json::from_slice(&content)?)
  }

  async fn log(&self, job_id: &str) -> Result<ByteStream, BundleError> {
    let file = File::open(self.log_path(job_id))
      .await
      .map_err(not_found(job_id))?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(BundleError::Io));
    Ok(Box::pin(stream))
  }

  async fn delete(&self, job_id: &str) -> Result<(), BundleError> {
    fs::remove_dir_all(self.job_dir(job_id))
      .await
      .map_err(not_found(job_id))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use lava_pipeline::{Context, JobOutcome, JobStatus, ResultValue, TestResult};

  use super::*;

  fn bundle(job_id: &str) -> ResultBundle {
    let mut context = Context::new();
    context.add_result(TestResult::new("0_smoke", "ping", ResultValue::Pass));
    ResultBundle::from_outcome(&JobOutcome {
      job_id: job_id.to_string(),
      status: JobStatus::Pass,
      errors: Vec::new(),
      context,
      duration: Duration::from_secs(3),
    })
  }

  #[tokio::test]
  async fn test_put_get_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsBundleStore::new(tmp.path());

    let stored = bundle("7");
    store.put(&stored).await.unwrap();
    assert_eq!(store.get("7").await.unwrap(), stored);
    assert!(!tmp.path().join("7/bundle.json.partial").exists());

    store.delete("7").await.unwrap();
    assert!(matches!(store.get("7").await, Err(BundleError::NotFound(id)) if id == "7"));
    assert!(matches!(store.delete("7").await, Err(BundleError::NotFound(_))));
  }

  #[tokio::test]
  async fn test_log_stream() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsBundleStore::new(tmp.path());
    assert!(matches!(store.log("9").await, Err(BundleError::NotFound(_))));

    std::fs::create_dir_all(store.job_dir("9")).unwrap();
    std::fs::write(store.log_path("9"), b"{\"msg\":\"job_started\"}\n").unwrap();

    let mut stream = store.log("9").await.unwrap();
    let mut content = Vec::new();
    while let Some(chunk) = stream.next().await {
      content.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(content, b"{\"msg\":\"job_started\"}\n");
  }
}
