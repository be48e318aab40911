use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timeout::TimeoutSpec;

/// Host-side dispatcher settings.
///
/// Every field has a default so an empty or missing file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
  /// Per-job temporary space: downloads, overlays, fetched repositories.
  pub scratch_dir: PathBuf,
  /// Where result bundles and job logs are written.
  pub results_dir: PathBuf,
  /// Bound on every VCS or URL fetch.
  pub fetch_timeout: TimeoutSpec,
  pub job_timeout: TimeoutSpec,
  pub action_timeout: TimeoutSpec,
  pub connection_timeout: TimeoutSpec,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self::with_data_dir(&std::env::temp_dir().join("lava"))
  }
}

impl DispatcherConfig {
  /// Defaults rooted at the given data directory.
  pub fn with_data_dir(data_dir: &Path) -> Self {
    Self {
      scratch_dir: data_dir.join("tmp"),
      results_dir: data_dir.join("results"),
      fetch_timeout: TimeoutSpec::minutes(5),
      job_timeout: TimeoutSpec::minutes(30),
      action_timeout: TimeoutSpec::minutes(5),
      connection_timeout: TimeoutSpec::minutes(4),
    }
  }

  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    if content.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::parse("dispatcher configuration", e))
  }

  /// Load from `path`, falling back to defaults under `data_dir` when the
  /// file does not exist.
  pub fn load_or_default(path: &Path, data_dir: &Path) -> Result<Self, ConfigError> {
    match std::fs::read_to_string(path) {
      Ok(content) if content.trim().is_empty() => Ok(Self::with_data_dir(data_dir)),
      Ok(content) => {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::parse(path.display().to_string(), e))
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::with_data_dir(data_dir)),
      Err(source) => Err(ConfigError::Io {
        path: path.to_path_buf(),
        source,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = DispatcherConfig::from_yaml("fetch_timeout: {seconds: 30}\n").unwrap();
    assert_eq!(config.fetch_timeout, TimeoutSpec::seconds(30));
    assert_eq!(config.action_timeout, TimeoutSpec::minutes(5));
  }

  #[test]
  fn test_missing_file_uses_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config =
      DispatcherConfig::load_or_default(&dir.path().join("absent.yaml"), dir.path()).unwrap();
    assert_eq!(config.scratch_dir, dir.path().join("tmp"));
  }
}
