use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use lava_pipeline::{Action, ActionMeta, BuildContext, JobState, LavaError};
use lava_testdef::UrlFetcher;
use serde_json::{Value, json};
use tracing::info;

use crate::keys;

/// Fetch one image of the deploy block into the job's download directory
/// and record where it landed.
pub struct DownloaderAction {
  meta: ActionMeta,
  label: String,
  image: Value,
  dest: PathBuf,
  fetch_timeout: Duration,
}

impl DownloaderAction {
  pub fn new(label: &str, image: &Value) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "download-action",
        "download an image to the dispatcher",
        format!("download {label}"),
      ),
      label: label.to_string(),
      image: image.clone(),
      dest: PathBuf::new(),
      fetch_timeout: Duration::from_secs(300),
    })
  }

  fn url(&self) -> Option<&str> {
    match &self.image {
      Value::String(url) => Some(url),
      other => other.get("url").and_then(Value::as_str),
    }
  }

  fn file_name(&self) -> String {
    self
      .url()
      .map(|url| url.split(['?', '#']).next().unwrap_or(url))
      .and_then(|url| url.rsplit('/').next())
      .filter(|name| !name.is_empty())
      .unwrap_or(self.label.as_str())
      .to_string()
  }
}

#[async_trait]
impl Action for DownloaderAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.dest = build.job_dir().join("downloads").join(&self.label);
    self.fetch_timeout = build.dispatcher.fetch_timeout.as_duration();
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    let mut errors = Vec::new();
    match self.url() {
      None => errors.push(format!("Invalid image for {}: no url", self.label)),
      Some(url) if url.trim().is_empty() => {
        errors.push(format!("Invalid image for {}: empty url", self.label))
      }
      Some(_) => {}
    }
    if let Some(sum) = self.image.get("sha256sum")
      && sum.as_str().is_none_or(|s| s.len() != 64)
    {
      errors.push(format!("Invalid sha256sum for {}", self.label));
    }
    errors
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let url = self
      .url()
      .ok_or_else(|| LavaError::job(format!("no url for {}", self.label)))?;
    let expected = self.image.get("sha256sum").and_then(Value::as_str);
    let path = self.dest.join(self.file_name());

    let download = UrlFetcher::new(self.fetch_timeout)
      .download(url, &path, expected)
      .await?;
    info!(
      label = %self.label,
      path = %download.path.display(),
      size = download.size,
      sha256 = %download.sha256,
      "download_completed"
    );

    let level = self.meta.level.clone();
    state.context.set(
      keys::downloaded_file(&self.label),
      json!(download.path.display().to_string()),
      &level,
    );
    state
      .context
      .set(keys::downloaded_sha256(&self.label), json!(download.sha256), &level);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn downloader(image: Value) -> DownloaderAction {
    DownloaderAction {
      meta: ActionMeta::new("download-action", "", ""),
      label: "rootfs".to_string(),
      image,
      dest: PathBuf::new(),
      fetch_timeout: Duration::from_secs(1),
    }
  }

  #[test]
  fn test_file_name_from_url() {
    let action = downloader(json!({"url": "https://images.example.com/kvm/rootfs.img.gz?token=1"}));
    assert_eq!(action.file_name(), "rootfs.img.gz");
    let action = downloader(json!("file:///srv/images/"));
    assert_eq!(action.file_name(), "rootfs");
  }

  #[test]
  fn test_validate() {
    assert_eq!(downloader(json!({})).validate(), vec!["Invalid image for rootfs: no url"]);
    assert_eq!(
      downloader(json!({"url": "http://x/y.img", "sha256sum": "abc"})).validate(),
      vec!["Invalid sha256sum for rootfs"]
    );
  }
}
