use async_trait::async_trait;
use lava_pipeline::{Action, ActionMeta, BuildContext, JobState, LavaError, Pipeline};
use lava_testdef::OverlayBuilder;
use serde_json::json;
use tracing::info;

use super::environment::env_vars;
use crate::keys;
use crate::testdef::{TestDefinitionAction, definition_entries};

/// The overlay of this job, rooted in its scratch directory.
pub(crate) fn overlay_builder(build: &BuildContext) -> OverlayBuilder {
  OverlayBuilder::new(build.job_dir().join("overlay"), build.deployment.clone())
}

/// Builds the directory tree copied onto the target: helper scripts, one
/// directory per test definition, the runner configuration and the
/// startup hook of the deployment profile.
pub struct OverlayAction {
  meta: ActionMeta,
  builder: Option<OverlayBuilder>,
  test_dirs: Vec<String>,
  pipeline: Option<Pipeline>,
}

impl OverlayAction {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "lava-overlay",
        "add lava scripts during deployment for test shell use",
        "overlay the lava support scripts",
      ),
      builder: None,
      test_dirs: Vec::new(),
      pipeline: None,
    })
  }
}

#[async_trait]
impl Action for OverlayAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let builder = overlay_builder(build);
    self.test_dirs = definition_entries(&build.job)
      .iter()
      .map(|entry| builder.test_dir(&entry.run_id).1)
      .collect();
    self.builder = Some(builder);

    if build.job.has_tests() {
      let mut pipeline = Pipeline::child(&self.meta);
      pipeline.add_action(TestDefinitionAction::new(), build)?;
      self.pipeline = Some(pipeline);
    }
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    match self.meta.parameters.get("env_dut") {
      Some(value) => env_vars(value).err().into_iter().collect(),
      None => Vec::new(),
    }
  }

  fn pipeline(&self) -> Option<&Pipeline> {
    self.pipeline.as_ref()
  }

  fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
    self.pipeline.as_mut()
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let builder = self
      .builder
      .as_ref()
      .ok_or_else(|| LavaError::infrastructure("lava-overlay was not populated"))?;
    builder.prepare().await?;
    state.context.set(
      keys::overlay_dir(),
      json!(builder.root().display().to_string()),
      &self.meta.level,
    );

    if let Some(pipeline) = self.pipeline.as_mut() {
      pipeline.run(state).await?;
    }

    builder.write_runner_conf(&self.test_dirs).await?;
    builder.configure_startup().await?;
    let vars = match self.meta.parameters.get("env_dut") {
      Some(value) => env_vars(value).map_err(LavaError::job)?,
      None => Default::default(),
    };
    builder.write_environment(&vars).await?;

    info!(
      root = %builder.root().display(),
      tests = self.test_dirs.len(),
      "overlay_created"
    );
    Ok(())
  }
}
