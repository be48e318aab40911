//! Fetching test content: VCS checkouts and URL downloads.
//!
//! Every fetch is bounded by a timeout; running out of time is a
//! [`FetchError::Timeout`], which the pipeline treats as an
//! infrastructure failure.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::FetchError;

/// Version control systems a test definition can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
  Git,
  Bzr,
}

impl fmt::Display for Vcs {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Vcs::Git => f.write_str("git"),
      Vcs::Bzr => f.write_str("bzr"),
    }
  }
}

/// A finished checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
  pub path: PathBuf,
  /// Revision that was checked out: a commit hash or a bzr revno.
  pub revision: Option<String>,
}

/// Checks out a repository.
#[async_trait]
pub trait VcsFetcher: Send + Sync {
  /// Check out `locator` at `revision` (latest when `None`) into `dest`.
  async fn fetch(
    &self,
    locator: &str,
    revision: Option<&str>,
    dest: &Path,
  ) -> Result<Checkout, FetchError>;
}

/// Run a command to completion within `timeout`, returning its trimmed
/// stdout.
async fn run_command(mut command: Command, timeout: Duration, locator: &str) -> Result<String, FetchError> {
  let shown = format!("{:?}", command.as_std());
  debug!(command = %shown, "running fetch command");
  command
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let child = command.spawn().map_err(|e| FetchError::Command {
    command: shown.clone(),
    status: "spawn failure".to_string(),
    stderr: e.to_string(),
  })?;

  let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
    Ok(output) => output.map_err(|e| FetchError::Command {
      command: shown.clone(),
      status: "wait failure".to_string(),
      stderr: e.to_string(),
    })?,
    Err(_) => {
      return Err(FetchError::Timeout {
        locator: locator.to_string(),
        timeout,
      });
    }
  };

  if !output.status.success() {
    return Err(FetchError::Command {
      command: shown,
      status: output.status.to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `git clone`, then `git checkout <revision>` when one is given.
#[derive(Debug, Clone)]
pub struct GitFetcher {
  timeout: Duration,
}

impl GitFetcher {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }
}

#[async_trait]
impl VcsFetcher for GitFetcher {
  async fn fetch(
    &self,
    locator: &str,
    revision: Option<&str>,
    dest: &Path,
  ) -> Result<Checkout, FetchError> {
    info!(repository = %locator, revision = ?revision, dest = %dest.display(), "git clone");
    let mut clone = Command::new("git");
    clone.arg("clone").arg(locator).arg(dest);
    run_command(clone, self.timeout, locator).await?;

    if let Some(revision) = revision {
      let mut checkout = Command::new("git");
      checkout.arg("-C").arg(dest).arg("checkout").arg(revision);
      run_command(checkout, self.timeout, locator).await?;
    }

    let mut head = Command::new("git");
    head.arg("-C").arg(dest).args(["log", "-1", "--format=%H"]);
    let commit = run_command(head, self.timeout, locator).await?;
    debug!(repository = %locator, commit = %commit, "git checkout resolved");
    Ok(Checkout {
      path: dest.to_path_buf(),
      revision: Some(commit).filter(|c| !c.is_empty()),
    })
  }
}

/// `bzr branch -r <revision>`; `-1` (the branch tip) when none is given.
#[derive(Debug, Clone)]
pub struct BzrFetcher {
  timeout: Duration,
}

impl BzrFetcher {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }
}

#[async_trait]
impl VcsFetcher for BzrFetcher {
  async fn fetch(
    &self,
    locator: &str,
    revision: Option<&str>,
    dest: &Path,
  ) -> Result<Checkout, FetchError> {
    let revision = revision.unwrap_or("-1");
    info!(repository = %locator, revision = %revision, dest = %dest.display(), "bzr branch");
    let mut branch = Command::new("bzr");
    branch
      .arg("branch")
      .arg("-r")
      .arg(revision)
      .arg(locator)
      .arg(dest)
      // Keep bzr from picking up whoami, ssh keys and the like.
      .env("BZR_HOME", "/dev/null")
      .env("BZR_LOG", "/dev/null");
    run_command(branch, self.timeout, locator).await?;

    let mut revno = Command::new("bzr");
    revno
      .arg("revno")
      .arg(dest)
      .env("BZR_HOME", "/dev/null")
      .env("BZR_LOG", "/dev/null");
    let revno = run_command(revno, self.timeout, locator).await?;
    debug!(repository = %locator, revno = %revno, "bzr branch resolved");
    Ok(Checkout {
      path: dest.to_path_buf(),
      revision: Some(revno).filter(|r| !r.is_empty()),
    })
  }
}

/// A finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
  pub path: PathBuf,
  pub size: u64,
  pub sha256: String,
}

/// Downloads `http(s)://` URLs and copies `file://` URLs or plain paths.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
  client: reqwest::Client,
  timeout: Duration,
}

impl UrlFetcher {
  pub fn new(timeout: Duration) -> Self {
    Self {
      client: reqwest::Client::new(),
      timeout,
    }
  }

  /// Fetch `url` into `dest`, verifying the sha256 checksum when given.
  pub async fn download(
    &self,
    url: &str,
    dest: &Path,
    sha256: Option<&str>,
  ) -> Result<Download, FetchError> {
    let result = tokio::time::timeout(self.timeout, self.download_inner(url, dest)).await;
    let download = match result {
      Ok(download) => download?,
      Err(_) => {
        return Err(FetchError::Timeout {
          locator: url.to_string(),
          timeout: self.timeout,
        });
      }
    };

    if let Some(expected) = sha256
      && !expected.eq_ignore_ascii_case(&download.sha256)
    {
      return Err(FetchError::Checksum {
        url: url.to_string(),
        expected: expected.to_string(),
        actual: download.sha256,
      });
    }
    info!(url = %url, dest = %dest.display(), size = download.size, "download complete");
    Ok(download)
  }

  async fn download_inner(&self, url: &str, dest: &Path) -> Result<Download, FetchError> {
    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| FetchError::io(parent, e))?;
    }
    let mut file = tokio::fs::File::create(dest)
      .await
      .map_err(|e| FetchError::io(dest, e))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    if url.starts_with("http://") || url.starts_with("https://") {
      let response = self
        .client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| FetchError::Http {
          url: url.to_string(),
          message: e.to_string(),
        })?;
      let mut stream = response.bytes_stream();
      while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk.map_err(|e| FetchError::Http {
          url: url.to_string(),
          message: e.to_string(),
        })?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(|e| FetchError::io(dest, e))?;
      }
    } else {
      let source = local_path(url)?;
      let content = tokio::fs::read(&source)
        .await
        .map_err(|e| FetchError::io(&source, e))?;
      hasher.update(&content);
      size = content.len() as u64;
      file.write_all(&content).await.map_err(|e| FetchError::io(dest, e))?;
    }

    file.flush().await.map_err(|e| FetchError::io(dest, e))?;
    Ok(Download {
      path: dest.to_path_buf(),
      size,
      sha256: hex::encode(hasher.finalize()),
    })
  }
}

/// Local path of a `file://` URL or plain absolute path.
fn local_path(url: &str) -> Result<PathBuf, FetchError> {
  if let Some(path) = url.strip_prefix("file://") {
    return Ok(PathBuf::from(path));
  }
  if url.contains("://") {
    return Err(FetchError::Unsupported(url.to_string()));
  }
  Ok(PathBuf::from(url))
}

/// The fetchers a job uses, shared between actions.
#[derive(Clone)]
pub struct Fetchers {
  pub git: Arc<dyn VcsFetcher>,
  pub bzr: Arc<dyn VcsFetcher>,
  pub url: UrlFetcher,
}

impl Fetchers {
  pub fn new(timeout: Duration) -> Self {
    Self {
      git: Arc::new(GitFetcher::new(timeout)),
      bzr: Arc::new(BzrFetcher::new(timeout)),
      url: UrlFetcher::new(timeout),
    }
  }

  pub fn vcs(&self, vcs: Vcs) -> &dyn VcsFetcher {
    match vcs {
      Vcs::Git => self.git.as_ref(),
      Vcs::Bzr => self.bzr.as_ref(),
    }
  }
}

impl fmt::Debug for Fetchers {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Fetchers").field("url", &self.url).finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_file_download_with_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rootfs.tar");
    std::fs::write(&source, b"hello").unwrap();
    let fetcher = UrlFetcher::new(Duration::from_secs(5));

    let url = format!("file://{}", source.display());
    let dest = dir.path().join("downloads/rootfs.tar");
    let expected = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    let download = fetcher.download(&url, &dest, Some(expected)).await.unwrap();
    assert_eq!(download.size, 5);
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello");

    let err = fetcher
      .download(&url, &dest, Some("00"))
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Checksum { .. }));
  }

  #[tokio::test]
  async fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = UrlFetcher::new(Duration::from_secs(5));
    let err = fetcher
      .download("/nonexistent/lava/file", &dir.path().join("out"), None)
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Io { .. }));
    assert!(matches!(local_path("ftp://x"), Err(FetchError::Unsupported(_))));
  }

  fn git(dir: &Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
      .arg("-C")
      .arg(dir)
      .args(["-c", "user.name=lava", "-c", "user.email=lava@localhost"])
      .args(args)
      .output()
      .map(|o| o.status.success())
      .unwrap_or(false)
  }

  #[tokio::test]
  async fn test_git_checkout_reports_commit() {
    let dir = tempfile::tempdir().unwrap();
    let origin = dir.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    std::fs::write(origin.join("smoke.yaml"), "metadata: {name: smoke}\n").unwrap();
    if !git(&origin, &["init", "-q"])
      || !git(&origin, &["add", "smoke.yaml"])
      || !git(&origin, &["commit", "-q", "-m", "smoke"])
    {
      // No usable git on this host.
      return;
    }
    let head = std::process::Command::new("git")
      .arg("-C")
      .arg(&origin)
      .args(["rev-parse", "HEAD"])
      .output()
      .unwrap();
    let head = String::from_utf8(head.stdout).unwrap().trim().to_string();

    let fetcher = GitFetcher::new(Duration::from_secs(30));
    let checkout = fetcher
      .fetch(&origin.display().to_string(), None, &dir.path().join("checkout"))
      .await
      .unwrap();
    assert!(checkout.path.join("smoke.yaml").exists());
    assert_eq!(checkout.revision.as_deref(), Some(head.as_str()));
  }

  #[tokio::test]
  async fn test_failed_clone_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = GitFetcher::new(Duration::from_secs(30));
    let result = fetcher
      .fetch(
        &dir.path().join("no-such-repo").display().to_string(),
        None,
        &dir.path().join("checkout"),
      )
      .await;
    assert!(result.is_err());
  }
}
