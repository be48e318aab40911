//! Resolving test definition locators into [`TestDefinition`]s.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, instrument};

use crate::definition::{TestDefinition, TestSource};
use crate::error::LoadError;
use crate::fetch::{Fetchers, Vcs};

/// A repository holding one or more test definition files.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoLocator {
  pub vcs: Vcs,
  pub repository: String,
  pub revision: Option<String>,
  /// Paths of the definition files inside the repository.
  pub testdefs: Vec<String>,
  /// Name for the definition, overriding the document's own.
  pub name: Option<String>,
}

impl RepoLocator {
  /// Parse the `{git-repo|bzr-repo, revision, testdefs}` form.
  pub fn from_value(value: &Value) -> Result<Self, LoadError> {
    let (vcs, repository) = if let Some(repo) = value.get("git-repo").and_then(Value::as_str) {
      (Vcs::Git, repo)
    } else if let Some(repo) = value.get("bzr-repo").and_then(Value::as_str) {
      (Vcs::Bzr, repo)
    } else {
      return Err(LoadError::Locator(
        "repository locator needs a git-repo or bzr-repo".to_string(),
      ));
    };
    let testdefs: Vec<String> = value
      .get("testdefs")
      .and_then(Value::as_array)
      .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
      .unwrap_or_default();
    if testdefs.is_empty() {
      return Err(LoadError::Locator(format!("no testdefs listed for {repository}")));
    }
    Ok(Self {
      vcs,
      repository: repository.to_string(),
      revision: value.get("revision").and_then(Value::as_str).map(str::to_string),
      testdefs,
      name: None,
    })
  }

  /// A single definition file in a repository.
  pub fn single(
    vcs: Vcs,
    repository: impl Into<String>,
    path: impl Into<String>,
    revision: Option<String>,
    name: Option<String>,
  ) -> Self {
    Self {
      vcs,
      repository: repository.into(),
      revision,
      testdefs: vec![path.into()],
      name,
    }
  }
}

/// Loads test definitions in job order. The position of each definition
/// in the loader is its index, so run ids are unique and stable.
pub struct TestDefinitionLoader {
  tmpbase: PathBuf,
  fetchers: Fetchers,
  testdefs: Vec<TestDefinition>,
  first_index: usize,
  fetches: usize,
}

impl TestDefinitionLoader {
  pub fn new(tmpbase: impl Into<PathBuf>, fetchers: Fetchers) -> Self {
    Self {
      tmpbase: tmpbase.into(),
      fetchers,
      testdefs: Vec::new(),
      first_index: 0,
      fetches: 0,
    }
  }

  /// Number definitions from `index` instead of zero, for loaders that
  /// handle one part of a job.
  pub fn starting_at(mut self, index: usize) -> Self {
    self.first_index = index;
    self
  }

  pub fn testdefs(&self) -> &[TestDefinition] {
    &self.testdefs
  }

  pub fn into_testdefs(self) -> Vec<TestDefinition> {
    self.testdefs
  }

  fn scratch(&mut self, kind: &str) -> PathBuf {
    self.fetches += 1;
    self.tmpbase.join(format!("{kind}-{}", self.fetches))
  }

  fn append(
    &mut self,
    document: Value,
    name: Option<&str>,
    source: TestSource,
  ) -> Result<&TestDefinition, LoadError> {
    let name = name
      .or_else(|| TestDefinition::declared_name(&document))
      .ok_or_else(|| LoadError::Parse {
        what: source.kind().to_string(),
        message: "no name given and metadata.name is missing".to_string(),
      })?
      .to_string();
    let index = self.first_index + self.testdefs.len();
    let testdef = TestDefinition::new(index, name, source, document);
    info!(run_id = %testdef.run_id, source = testdef.source.kind(), "test definition loaded");
    self.testdefs.push(testdef);
    let last = self.testdefs.len() - 1;
    Ok(&self.testdefs[last])
  }

  /// Download a single definition file.
  #[instrument(skip(self))]
  pub async fn load_from_url(
    &mut self,
    url: &str,
    name: Option<&str>,
  ) -> Result<&TestDefinition, LoadError> {
    let dir = self.scratch("url");
    let file = dir.join("testdef.yaml");
    self.fetchers.url.download(url, &file, None).await?;
    let document = read_document(&file).await?;
    self.append(
      document,
      name,
      TestSource::Url {
        url: url.to_string(),
      },
    )
  }

  /// Check out a repository and load every listed definition file from it.
  /// Returns how many definitions were added.
  #[instrument(skip(self, locator), fields(repository = %locator.repository, vcs = %locator.vcs))]
  pub async fn load_from_repo(&mut self, locator: &RepoLocator) -> Result<usize, LoadError> {
    let dest = self.scratch(&locator.vcs.to_string());
    let checkout = self
      .fetchers
      .vcs(locator.vcs)
      .fetch(&locator.repository, locator.revision.as_deref(), &dest)
      .await?;

    for path in &locator.testdefs {
      let document = read_document(&checkout.path.join(path)).await?;
      let name = match locator.testdefs.len() {
        1 => locator.name.as_deref(),
        _ => None,
      };
      self.append(
        document,
        name,
        TestSource::Repo {
          vcs: locator.vcs,
          repository: locator.repository.clone(),
          revision: locator.revision.clone(),
          commit: checkout.revision.clone(),
          path: path.clone(),
          checkout: checkout.path.clone(),
        },
      )?;
    }
    Ok(locator.testdefs.len())
  }

  /// A definition embedded in the job itself.
  pub fn load_inline(
    &mut self,
    document: Value,
    name: Option<&str>,
  ) -> Result<&TestDefinition, LoadError> {
    self.append(document, name, TestSource::Inline)
  }
}

/// Parse a definition file (YAML).
pub async fn read_document(path: &Path) -> Result<Value, LoadError> {
  let content = tokio::fs::read_to_string(path)
    .await
    .map_err(|e| LoadError::io(path, e))?;
  serde_yaml::from_str(&content).map_err(|e| LoadError::Parse {
    what: path.display().to_string(),
    message: e.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use async_trait::async_trait;
  use serde_json::json;

  use super::*;
  use crate::error::FetchError;
  use crate::fetch::{Checkout, VcsFetcher};

  /// Creates a fake checkout from fixed files.
  struct FakeVcs {
    files: Vec<(&'static str, &'static str)>,
  }

  #[async_trait]
  impl VcsFetcher for FakeVcs {
    async fn fetch(
      &self,
      _locator: &str,
      _revision: Option<&str>,
      dest: &Path,
    ) -> Result<Checkout, FetchError> {
      for (path, content) in &self.files {
        let file = dest.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, content).unwrap();
      }
      Ok(Checkout {
        path: dest.to_path_buf(),
        revision: Some("9e1c0d".to_string()),
      })
    }
  }

  struct FailingVcs;

  #[async_trait]
  impl VcsFetcher for FailingVcs {
    async fn fetch(&self, locator: &str, _: Option<&str>, _: &Path) -> Result<Checkout, FetchError> {
      Err(FetchError::Timeout {
        locator: locator.to_string(),
        timeout: Duration::from_secs(1),
      })
    }
  }

  fn fetchers(git: Arc<dyn VcsFetcher>) -> Fetchers {
    let mut fetchers = Fetchers::new(Duration::from_secs(5));
    fetchers.git = git;
    fetchers
  }

  #[tokio::test]
  async fn test_repo_loads_every_listed_file() {
    let dir = tempfile::tempdir().unwrap();
    let git = Arc::new(FakeVcs {
      files: vec![
        ("smoke.yaml", "metadata: {name: smoke}\nrun: {steps: [uname]}\n"),
        ("net/ping.yaml", "metadata: {name: ping}\nrun: {steps: [ping -c1 host]}\n"),
      ],
    });
    let mut loader = TestDefinitionLoader::new(dir.path(), fetchers(git));
    loader.load_inline(json!({"metadata": {"name": "first"}}), None).unwrap();

    let locator = RepoLocator::from_value(&json!({
      "git-repo": "https://example.com/tests.git",
      "testdefs": ["smoke.yaml", "net/ping.yaml"],
    }))
    .unwrap();
    let added = loader.load_from_repo(&locator).await.unwrap();
    assert_eq!(added, 2);

    let ids: Vec<_> = loader.testdefs().iter().map(|t| t.run_id.as_str()).collect();
    assert_eq!(ids, vec!["0_first", "1_smoke", "2_ping"]);
    assert_eq!(loader.testdefs()[2].run_steps(), vec!["ping -c1 host"]);

    assert!(loader.testdefs()[0].software_source().is_none());
    let source = loader.testdefs()[1].software_source().unwrap();
    assert_eq!(source.branch_url, "https://example.com/tests.git");
    assert_eq!(source.branch_revision, "9e1c0d");
  }

  #[tokio::test]
  async fn test_fetch_failure_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader = TestDefinitionLoader::new(dir.path(), fetchers(Arc::new(FailingVcs)));
    let locator = RepoLocator::single(Vcs::Git, "https://example.com/x.git", "a.yaml", None, None);
    let err = loader.load_from_repo(&locator).await.unwrap_err();
    assert!(matches!(err, LoadError::Fetch(FetchError::Timeout { .. })));
    assert!(loader.testdefs().is_empty());
  }

  #[tokio::test]
  async fn test_load_from_url_with_name_override() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("def.yaml");
    std::fs::write(&file, "metadata: {name: declared}\nrun: {steps: []}\n").unwrap();

    let mut loader = TestDefinitionLoader::new(dir.path().join("tmp"), Fetchers::new(Duration::from_secs(5)));
    let url = format!("file://{}", file.display());
    let def = loader.load_from_url(&url, Some("renamed")).await.unwrap();
    assert_eq!(def.run_id, "0_renamed");
    let def = loader.load_from_url(&url, None).await.unwrap();
    assert_eq!(def.run_id, "1_declared");
  }

  #[test]
  fn test_starting_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader =
      TestDefinitionLoader::new(dir.path(), Fetchers::new(Duration::from_secs(5))).starting_at(4);
    let def = loader.load_inline(json!({"run": {"steps": []}}), Some("late")).unwrap();
    assert_eq!(def.run_id, "4_late");
    assert_eq!(def.index, 4);
  }

  #[test]
  fn test_locator_needs_repo_and_files() {
    assert!(RepoLocator::from_value(&json!({"testdefs": ["a.yaml"]})).is_err());
    assert!(RepoLocator::from_value(&json!({"bzr-repo": "lp:x"})).is_err());
    let locator = RepoLocator::from_value(&json!({
      "bzr-repo": "lp:lava-test", "revision": "42", "testdefs": ["a.yaml"]
    }))
    .unwrap();
    assert_eq!(locator.vcs, Vcs::Bzr);
    assert_eq!(locator.revision.as_deref(), Some("42"));
  }
}
