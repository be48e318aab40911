//! Test definitions in the overlay: one repository action plus three
//! overlay writers per entry of the job's `definitions`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use lava_config::{JobDefinition, Parameters};
use lava_pipeline::{Acceptance, Action, ActionMeta, BuildContext, JobState, LavaError, Pipeline};
use lava_testdef::{
  CopyOptions, Fetchers, RepoLocator, SkipSet, TestDefinition, TestDefinitionLoader, TestSource, Vcs,
  valid_name,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::deploy::overlay_builder;
use crate::keys;

/// One entry of a test block's `definitions`, numbered across the job.
#[derive(Debug, Clone)]
pub struct DefinitionEntry {
  pub index: usize,
  pub name: String,
  pub run_id: String,
  pub parameters: Parameters,
}

impl DefinitionEntry {
  fn str_param(&self, key: &str) -> Option<&str> {
    self.parameters.get(key).and_then(Value::as_str)
  }
}

/// Every definition of every test block, in submission order.
pub fn definition_entries(job: &JobDefinition) -> Vec<DefinitionEntry> {
  job
    .test_definitions()
    .into_iter()
    .enumerate()
    .map(|(index, value)| {
      let parameters = value.as_object().cloned().unwrap_or_default();
      let name = parameters
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      DefinitionEntry {
        index,
        run_id: format!("{index}_{name}"),
        name,
        parameters,
      }
    })
    .collect()
}

/// Where a definition's content comes from, chosen by `from`.
pub trait RepoStrategy: Send + Sync {
  fn name(&self) -> &'static str;

  fn priority(&self) -> i32 {
    1
  }

  fn accepts(&self, entry: &Parameters) -> Acceptance;

  fn action(&self, entry: &DefinitionEntry) -> Box<dyn Action>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
  Git,
  Bzr,
  Url,
  Inline,
}

impl RepoStrategy for RepoKind {
  fn name(&self) -> &'static str {
    match self {
      RepoKind::Git => "git",
      RepoKind::Bzr => "bzr",
      RepoKind::Url => "url",
      RepoKind::Inline => "inline",
    }
  }

  fn accepts(&self, entry: &Parameters) -> Acceptance {
    if entry.get("from").and_then(Value::as_str) != Some(self.name()) {
      return Acceptance::reject(format!("\"from\" is not \"{}\"", self.name()));
    }
    match (self, entry.get("repository")) {
      (_, None) => Acceptance::reject("\"repository\" is not in the test definition"),
      (RepoKind::Inline, Some(Value::Object(_))) => Acceptance::accept(),
      (RepoKind::Inline, Some(_)) => Acceptance::reject("inline \"repository\" is not a mapping"),
      (_, Some(Value::String(_))) => Acceptance::accept(),
      (_, Some(_)) => Acceptance::reject("\"repository\" is not a string"),
    }
  }

  fn action(&self, entry: &DefinitionEntry) -> Box<dyn Action> {
    Box::new(RepoAction::new(*self, entry.clone()))
  }
}

pub fn repo_strategies() -> Vec<Box<dyn RepoStrategy>> {
  vec![
    Box::new(RepoKind::Git),
    Box::new(RepoKind::Bzr),
    Box::new(RepoKind::Url),
    Box::new(RepoKind::Inline),
  ]
}

/// The accepting strategy with the highest priority, earliest registered
/// on ties; otherwise every rejection reason.
pub fn select_repo_strategy<'a>(
  strategies: &'a [Box<dyn RepoStrategy>],
  entry: &Parameters,
) -> Result<&'a dyn RepoStrategy, Vec<String>> {
  let mut best: Option<&dyn RepoStrategy> = None;
  let mut rejections = Vec::new();
  for strategy in strategies {
    let answer = strategy.accepts(entry);
    if !answer.accepted {
      rejections.push(format!("{}: {}", strategy.name(), answer.reason));
      continue;
    }
    if best.is_none_or(|current| strategy.priority() > current.priority()) {
      best = Some(strategy.as_ref());
    }
  }
  best.ok_or(rejections)
}

/// Host and target location of one definition's directory.
#[derive(Debug, Clone, Default)]
struct TestPaths {
  host_dir: PathBuf,
  target_dir: String,
}

impl TestPaths {
  fn resolve(build: &BuildContext, run_id: &str) -> Self {
    let (host_dir, target_dir) = overlay_builder(build).test_dir(run_id);
    Self {
      host_dir,
      target_dir,
    }
  }
}

fn copy_options(entry: &DefinitionEntry) -> Result<CopyOptions, Vec<String>> {
  Ok(CopyOptions {
    skip: SkipSet::from_value(entry.parameters.get("skip_install"))?,
    parameters: entry
      .parameters
      .get("parameters")
      .or_else(|| entry.parameters.get("params"))
      .cloned(),
  })
}

/// Groups the per-definition actions.
pub struct TestDefinitionAction {
  meta: ActionMeta,
  pipeline: Option<Pipeline>,
}

impl TestDefinitionAction {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "test-definition",
        "load test definitions into image",
        "loading test definitions",
      ),
      pipeline: None,
    })
  }
}

#[async_trait]
impl Action for TestDefinitionAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let strategies = repo_strategies();
    let mut pipeline = Pipeline::child(&self.meta);
    for entry in definition_entries(&build.job) {
      match select_repo_strategy(&strategies, &entry.parameters) {
        Ok(strategy) => {
          pipeline.add_action(strategy.action(&entry), build)?;
          pipeline.add_action(TestOverlayAction::new(&entry), build)?;
          pipeline.add_action(TestInstallAction::new(&entry), build)?;
          pipeline.add_action(TestRunScriptAction::new(&entry), build)?;
        }
        Err(reasons) => {
          self.meta.build_errors.push(format!(
            "No repository type accepts test definition {}",
            entry.run_id
          ));
          self.meta.build_errors.extend(reasons);
        }
      }
    }
    self.pipeline = Some(pipeline);
    Ok(())
  }

  fn pipeline(&self) -> Option<&Pipeline> {
    self.pipeline.as_ref()
  }

  fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
    self.pipeline.as_mut()
  }
}

/// Fetches a definition and copies its repository into the overlay.
pub struct RepoAction {
  meta: ActionMeta,
  kind: RepoKind,
  entry: DefinitionEntry,
  paths: TestPaths,
  scratch: PathBuf,
  fetch_timeout: Duration,
}

impl RepoAction {
  fn new(kind: RepoKind, entry: DefinitionEntry) -> Self {
    let meta = ActionMeta::new(
      format!("{}-repo-action", kind.name()),
      format!("apply {} repository of tests to the test image", kind.name()),
      format!("{} test definition {}", kind.name(), entry.name),
    );
    Self {
      meta,
      kind,
      entry,
      paths: TestPaths::default(),
      scratch: PathBuf::new(),
      fetch_timeout: Duration::from_secs(300),
    }
  }

  fn repository(&self) -> Result<&str, LavaError> {
    self
      .entry
      .str_param("repository")
      .ok_or_else(|| LavaError::job(format!("no repository for {}", self.entry.name)))
  }
}

#[async_trait]
impl Action for RepoAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.paths = TestPaths::resolve(build, &self.entry.run_id);
    self.scratch = build.job_dir().join("testdefs").join(&self.entry.run_id);
    self.fetch_timeout = build.dispatcher.fetch_timeout.as_duration();
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    let mut errors = Vec::new();
    let name = &self.entry.name;
    if name.is_empty() {
      errors.push(format!("Test definition {} has no name", self.entry.index));
    } else if !valid_name(name) {
      errors.push(format!("Invalid characters found in test definition name: {name}"));
    }

    match self.kind {
      RepoKind::Git | RepoKind::Bzr => {
        if self.entry.str_param("path").is_none() {
          errors.push(format!("Test definition {name} has no path"));
        }
      }
      RepoKind::Url => {}
      RepoKind::Inline => {
        let document = self.entry.parameters.get("repository").cloned().unwrap_or_default();
        if document.get("run").is_none() {
          errors.push(format!("Test definition {name} has no run section"));
        }
        let testdef = TestDefinition::new(self.entry.index, name.clone(), TestSource::Inline, document);
        errors.extend(testdef.pattern().errors());
      }
    }
    errors
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let fetchers = Fetchers::new(self.fetch_timeout);
    let mut loader = TestDefinitionLoader::new(&self.scratch, fetchers).starting_at(self.entry.index);
    let name = self.entry.name.clone();

    match self.kind {
      RepoKind::Git | RepoKind::Bzr => {
        let vcs = if self.kind == RepoKind::Git { Vcs::Git } else { Vcs::Bzr };
        let path = self
          .entry
          .str_param("path")
          .ok_or_else(|| LavaError::job(format!("no path for {name}")))?;
        let locator = RepoLocator::single(
          vcs,
          self.repository()?,
          path,
          self.entry.str_param("revision").map(str::to_string),
          Some(name.clone()),
        );
        loader.load_from_repo(&locator).await?;
      }
      RepoKind::Url => {
        loader.load_from_url(self.repository()?, Some(&name)).await?;
      }
      RepoKind::Inline => {
        let document = self.entry.parameters.get("repository").cloned().unwrap_or_default();
        loader.load_inline(document, Some(&name))?;
      }
    }

    let testdef = loader
      .into_testdefs()
      .pop()
      .ok_or_else(|| LavaError::job(format!("no test definition loaded for {name}")))?;
    let errors = testdef.validate();
    if !errors.is_empty() {
      return Err(LavaError::job(format!("{}: {}", testdef.run_id, errors.join("; "))));
    }

    testdef.copy_repository(&self.paths.host_dir).await?;
    if let Some(source) = testdef.software_source() {
      debug!(run_id = %testdef.run_id, revision = %source.branch_revision, "software source recorded");
      state
        .context
        .run_info_mut(&testdef.run_id)
        .software_sources
        .push(source);
    }
    keys::store_definition(&mut state.context, &testdef, &self.meta.level);
    info!(run_id = %testdef.run_id, source = testdef.source.kind(), "test definition fetched");
    Ok(())
  }
}

/// Writes `testdef.yaml`.
pub struct TestOverlayAction {
  meta: ActionMeta,
  run_id: String,
  paths: TestPaths,
}

impl TestOverlayAction {
  fn new(entry: &DefinitionEntry) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "test-overlay",
        "add test definition to the overlay",
        format!("overlay for {}", entry.run_id),
      ),
      run_id: entry.run_id.clone(),
      paths: TestPaths::default(),
    })
  }
}

#[async_trait]
impl Action for TestOverlayAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.paths = TestPaths::resolve(build, &self.run_id);
    Ok(())
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let testdef = keys::stored_definition(&state.context, &self.run_id)?;
    testdef.write_definition(&self.paths.host_dir).await?;
    Ok(())
  }
}

/// Writes `install.sh`, honouring `skip_install`.
pub struct TestInstallAction {
  meta: ActionMeta,
  entry: DefinitionEntry,
  paths: TestPaths,
  fetch_timeout: Duration,
}

impl TestInstallAction {
  fn new(entry: &DefinitionEntry) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "test-install-overlay",
        "overlay dependency installation steps",
        format!("install steps for {}", entry.run_id),
      ),
      entry: entry.clone(),
      paths: TestPaths::default(),
      fetch_timeout: Duration::from_secs(300),
    })
  }
}

#[async_trait]
impl Action for TestInstallAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.paths = TestPaths::resolve(build, &self.entry.run_id);
    self.fetch_timeout = build.dispatcher.fetch_timeout.as_duration();
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    copy_options(&self.entry).err().unwrap_or_default()
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let options = copy_options(&self.entry).map_err(LavaError::validation)?;
    let testdef = keys::stored_definition(&state.context, &self.entry.run_id)?;
    let fetchers = Fetchers::new(self.fetch_timeout);
    let written = testdef
      .write_install(&self.paths.host_dir, &self.paths.target_dir, &options, &fetchers)
      .await?;
    debug!(run_id = %self.entry.run_id, written, "install script");
    Ok(())
  }
}

/// Writes `run.sh`.
pub struct TestRunScriptAction {
  meta: ActionMeta,
  entry: DefinitionEntry,
  paths: TestPaths,
}

impl TestRunScriptAction {
  fn new(entry: &DefinitionEntry) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "test-runscript-overlay",
        "overlay run script onto image",
        format!("run script for {}", entry.run_id),
      ),
      entry: entry.clone(),
      paths: TestPaths::default(),
    })
  }
}

#[async_trait]
impl Action for TestRunScriptAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.paths = TestPaths::resolve(build, &self.entry.run_id);
    Ok(())
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let options = copy_options(&self.entry).map_err(LavaError::validation)?;
    let testdef = keys::stored_definition(&state.context, &self.entry.run_id)?;
    testdef
      .write_run(&self.paths.host_dir, &self.paths.target_dir, &options)
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn entry(value: Value) -> Parameters {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_repo_selection() {
    let strategies = repo_strategies();
    let git = entry(json!({"from": "git", "repository": "https://x/t.git", "path": "a.yaml", "name": "a"}));
    assert_eq!(select_repo_strategy(&strategies, &git).unwrap().name(), "git");

    let inline = entry(json!({"from": "inline", "repository": {"run": {"steps": []}}, "name": "i"}));
    assert_eq!(select_repo_strategy(&strategies, &inline).unwrap().name(), "inline");

    let bad = entry(json!({"from": "svn", "repository": "x"}));
    let reasons = select_repo_strategy(&strategies, &bad).err().unwrap();
    assert_eq!(reasons.len(), 4);
    assert_eq!(reasons[0], "git: \"from\" is not \"git\"");
  }

  #[test]
  fn test_inline_needs_mapping() {
    let answer = RepoKind::Inline.accepts(&entry(json!({"from": "inline", "repository": "x"})));
    assert!(!answer.accepted);
  }

  #[test]
  fn test_name_validation() {
    let def = DefinitionEntry {
      index: 0,
      name: "smoke tests".to_string(),
      run_id: "0_smoke tests".to_string(),
      parameters: entry(json!({"from": "git", "repository": "https://x/t.git", "path": "a.yaml"})),
    };
    let mut action = RepoAction::new(RepoKind::Git, def);
    assert_eq!(
      action.validate(),
      vec!["Invalid characters found in test definition name: smoke tests"]
    );
  }
}
