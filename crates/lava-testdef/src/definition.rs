use std::path::{Path, PathBuf};

use lava_pipeline::SoftwareSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::LoadError;
use crate::fetch::{Fetchers, Vcs};
use crate::pattern::PatternFixup;
use crate::script::{SkipInstall, SkipSet, install_script, run_script};

/// Names become directory names and signal arguments on the target:
/// `[-_a-zA-Z0-9.]+`.
pub fn valid_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Where a definition came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TestSource {
  Url {
    url: String,
  },
  Repo {
    vcs: Vcs,
    repository: String,
    revision: Option<String>,
    /// Revision the checkout actually resolved to.
    commit: Option<String>,
    path: String,
    /// Local checkout, copied next to the definition on the target.
    checkout: PathBuf,
  },
  Inline,
}

impl TestSource {
  pub fn kind(&self) -> &'static str {
    match self {
      TestSource::Url { .. } => "url",
      TestSource::Repo { vcs: Vcs::Git, .. } => "git",
      TestSource::Repo { vcs: Vcs::Bzr, .. } => "bzr",
      TestSource::Inline => "inline",
    }
  }
}

/// Options for [`TestDefinition::copy_test`].
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
  pub skip: SkipSet,
  /// Job-supplied values exported before the run steps.
  pub parameters: Option<Value>,
}

/// One test suite instance in a job.
#[derive(Debug, Clone)]
pub struct TestDefinition {
  pub index: usize,
  pub name: String,
  /// `{index}_{name}`: directory name on the target and the identifier
  /// used in signals.
  pub run_id: String,
  pub source: TestSource,
  /// The parsed YAML document.
  pub document: Value,
}

impl TestDefinition {
  pub fn new(index: usize, name: impl Into<String>, source: TestSource, document: Value) -> Self {
    let name = name.into();
    Self {
      index,
      run_id: format!("{index}_{name}"),
      name,
      source,
      document,
    }
  }

  /// The repository this definition came from, when its revision is
  /// known.
  pub fn software_source(&self) -> Option<SoftwareSource> {
    let TestSource::Repo {
      vcs,
      repository,
      revision,
      commit,
      ..
    } = &self.source
    else {
      return None;
    };
    let revision = commit.as_ref().or(revision.as_ref())?;
    Some(SoftwareSource {
      project_name: self.name.clone(),
      branch_vcs: vcs.to_string(),
      branch_url: repository.clone(),
      branch_revision: revision.clone(),
    })
  }

  /// The name declared in the document's metadata.
  pub fn declared_name(document: &Value) -> Option<&str> {
    document
      .get("metadata")
      .and_then(|m| m.get("name"))
      .and_then(Value::as_str)
  }

  pub fn install_steps(&self) -> Vec<&str> {
    self.steps("install")
  }

  pub fn run_steps(&self) -> Vec<&str> {
    self.steps("run")
  }

  fn steps(&self, section: &str) -> Vec<&str> {
    self
      .document
      .get(section)
      .and_then(|s| s.get("steps"))
      .and_then(Value::as_array)
      .map(|steps| steps.iter().filter_map(Value::as_str).collect())
      .unwrap_or_default()
  }

  /// The `parse` block, if any.
  pub fn parse_block(&self) -> Option<&Value> {
    self.document.get("parse")
  }

  /// Handler name and parameters from the `hooks` block.
  pub fn hooks(&self) -> Option<(&str, Option<&serde_json::Map<String, Value>>)> {
    let hooks = self.document.get("hooks")?;
    let name = hooks.get("handler-name").and_then(Value::as_str)?;
    Some((name, hooks.get("params").and_then(Value::as_object)))
  }

  pub fn pattern(&self) -> PatternFixup {
    PatternFixup::new(Some(self))
  }

  pub fn validate(&self) -> Vec<String> {
    let mut errors = Vec::new();
    if !valid_name(&self.name) {
      errors.push(format!(
        "Invalid characters found in test definition name: {}",
        self.name
      ));
    }
    if self.document.get("run").is_none() {
      errors.push(format!("Test definition {} has no run section", self.name));
    }
    errors.extend(self.pattern().errors());
    errors
  }

  /// Write the definition, `install.sh`, `run.sh` and any repository
  /// content into `host_dir`; `target_dir` is the same directory as seen
  /// from the target.
  pub async fn copy_test(
    &self,
    host_dir: &Path,
    target_dir: &str,
    options: &CopyOptions,
    fetchers: &Fetchers,
  ) -> Result<(), LoadError> {
    self.copy_repository(host_dir).await?;
    self.write_definition(host_dir).await?;
    self.write_install(host_dir, target_dir, options, fetchers).await?;
    self.write_run(host_dir, target_dir, options).await?;
    info!(run_id = %self.run_id, host_dir = %host_dir.display(), "test definition materialized");
    Ok(())
  }

  /// Copy the checkout of a repository definition, without VCS metadata.
  pub async fn copy_repository(&self, host_dir: &Path) -> Result<(), LoadError> {
    create_dir(host_dir).await?;
    if let TestSource::Repo { checkout, .. } = &self.source {
      copy_tree(checkout, host_dir).await?;
      debug!(run_id = %self.run_id, "copied repository content");
    }
    Ok(())
  }

  /// `testdef.yaml`.
  pub async fn write_definition(&self, host_dir: &Path) -> Result<(), LoadError> {
    let yaml = serde_yaml::to_string(&self.document).map_err(|e| LoadError::Parse {
      what: self.name.clone(),
      message: e.to_string(),
    })?;
    create_dir(host_dir).await?;
    write(&host_dir.join("testdef.yaml"), yaml).await
  }

  /// `install.sh` plus the repositories it needs. Returns whether the
  /// definition has an install section at all.
  pub async fn write_install(
    &self,
    host_dir: &Path,
    target_dir: &str,
    options: &CopyOptions,
    fetchers: &Fetchers,
  ) -> Result<bool, LoadError> {
    if self.document.get("install").is_none() {
      return Ok(false);
    }
    create_dir(host_dir).await?;
    if !options.skip.skips(SkipInstall::GitRepos) {
      self.clone_install_repos(host_dir, fetchers).await?;
    }
    let install = install_script(&self.document, target_dir, &options.skip);
    write(&host_dir.join("install.sh"), install).await?;
    Ok(true)
  }

  /// `run.sh`.
  pub async fn write_run(
    &self,
    host_dir: &Path,
    target_dir: &str,
    options: &CopyOptions,
  ) -> Result<(), LoadError> {
    let run = run_script(
      &self.document,
      &self.run_id,
      &self.name,
      target_dir,
      options.parameters.as_ref(),
    );
    create_dir(host_dir).await?;
    write(&host_dir.join("run.sh"), run).await
  }

  /// Clone `install.git-repos` and `install.bzr-repos` next to the
  /// definition.
  async fn clone_install_repos(&self, host_dir: &Path, fetchers: &Fetchers) -> Result<(), LoadError> {
    let install = self.document.get("install");
    for (vcs, key) in [(Vcs::Git, "git-repos"), (Vcs::Bzr, "bzr-repos")] {
      let repos = install
        .and_then(|i| i.get(key))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
      for repo in repos {
        let (url, destination, branch) = match &repo {
          Value::String(url) => (url.clone(), None, None),
          Value::Object(map) => {
            let url = map.get("url").and_then(Value::as_str).ok_or_else(|| {
              LoadError::Locator(format!("{key} entry without url in {}", self.name))
            })?;
            (
              url.to_string(),
              map.get("destination").and_then(Value::as_str).map(str::to_string),
              map.get("branch").and_then(Value::as_str).map(str::to_string),
            )
          }
          other => {
            return Err(LoadError::Locator(format!("unexpected {key} entry {other}")));
          }
        };
        let dir_name = destination.unwrap_or_else(|| repo_dir_name(&url));
        fetchers
          .vcs(vcs)
          .fetch(&url, branch.as_deref(), &host_dir.join(dir_name))
          .await?;
      }
    }
    Ok(())
  }
}

/// Directory a clone lands in: last path component without `.git`, with a
/// bzr `lp:` prefix removed.
fn repo_dir_name(url: &str) -> String {
  let trimmed = url.trim_end_matches('/').trim_start_matches("lp:");
  let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
  last.strip_suffix(".git").unwrap_or(last).to_string()
}

async fn create_dir(path: &Path) -> Result<(), LoadError> {
  tokio::fs::create_dir_all(path)
    .await
    .map_err(|e| LoadError::io(path, e))
}

async fn write(path: &Path, content: String) -> Result<(), LoadError> {
  tokio::fs::write(path, content)
    .await
    .map_err(|e| LoadError::io(path, e))
}

/// Recursive copy, leaving out VCS metadata.
pub async fn copy_tree(from: &Path, to: &Path) -> Result<(), LoadError> {
  let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
  while let Some((src, dst)) = pending.pop() {
    tokio::fs::create_dir_all(&dst)
      .await
      .map_err(|e| LoadError::io(&dst, e))?;
    let mut entries = tokio::fs::read_dir(&src)
      .await
      .map_err(|e| LoadError::io(&src, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| LoadError::io(&src, e))? {
      let name = entry.file_name();
      if name == ".git" || name == ".bzr" {
        continue;
      }
      let file_type = entry.file_type().await.map_err(|e| LoadError::io(entry.path(), e))?;
      let target = dst.join(&name);
      if file_type.is_dir() {
        pending.push((entry.path(), target));
      } else {
        tokio::fs::copy(entry.path(), &target)
          .await
          .map_err(|e| LoadError::io(&target, e))?;
      }
    }
  }
  Ok(())
}
