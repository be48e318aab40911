//! Turns a job definition into a runnable [`Job`].

use std::sync::Arc;

use lava_config::{DeploymentData, DeviceConfig, DispatcherConfig, JobDefinition, Section};
use lava_pipeline::{BuildContext, Job, LavaError, Pipeline, StrategyRegistry};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::builtin_strategies;
use crate::finalize::FinalizeAction;
use crate::test_shell::TESTDEF_OFFSET;

const DEFAULT_OS: &str = "debian";

/// Assembles pipelines from the strategies it was given.
pub struct JobParser {
  strategies: StrategyRegistry,
}

impl JobParser {
  pub fn new(strategies: StrategyRegistry) -> Self {
    Self { strategies }
  }

  /// A parser with every strategy shipped with the dispatcher.
  pub fn builtin() -> Self {
    Self::new(builtin_strategies())
  }

  /// Build the pipeline: one top-level action per deploy, boot and test
  /// block, chosen by strategy, then `finalize`.
  ///
  /// Blocks with an unknown command or that no strategy accepts are left
  /// out of the pipeline and reported by [`Job::validate`], together with
  /// the parameter errors of every block that was accepted.
  pub fn parse(
    &self,
    job_id: impl Into<String>,
    mut job: JobDefinition,
    device: DeviceConfig,
    dispatcher: DispatcherConfig,
  ) -> Result<Job, LavaError> {
    let job_id = job_id.into();
    let deployment = deployment_for(&job)?;
    number_test_blocks(&mut job);

    let job = Arc::new(job);
    let device = Arc::new(device);
    let dispatcher = Arc::new(dispatcher);
    let build = BuildContext::new(
      job_id.clone(),
      job.clone(),
      device.clone(),
      dispatcher.clone(),
      deployment,
    );

    let mut pipeline = Pipeline::root();
    let mut errors = Vec::new();
    for spec in &job.actions {
      let section = match spec.section() {
        Ok(section) => section,
        Err(e) => {
          errors.push(e.to_string());
          continue;
        }
      };
      if section == Section::Finalize {
        debug!("finalize block ignored, finalize is always added");
        continue;
      }
      match self.strategies.select(section, &device, &spec.parameters) {
        Ok(strategy) => {
          debug!(section = %section, strategy = strategy.name(), "strategy selected");
          pipeline.add_action(strategy.action(&spec.parameters), &build)?;
        }
        Err(LavaError::Validation { errors: found }) => errors.extend(found),
        Err(e) => return Err(e),
      }
    }
    pipeline.add_action(FinalizeAction::new(), &build)?;

    info!(job_id = %job_id, actions = pipeline.len(), rejected = errors.len(), "pipeline_built");
    Ok(Job::new(job_id, job, device, dispatcher, pipeline).with_build_errors(errors))
  }
}

/// The profile named by the first deploy block's `os`.
fn deployment_for(job: &JobDefinition) -> Result<DeploymentData, LavaError> {
  let os = job
    .blocks(Section::Deploy)
    .find_map(|spec| spec.parameters.get("os"))
    .and_then(Value::as_str)
    .unwrap_or(DEFAULT_OS);
  DeploymentData::for_os(os).ok_or_else(|| {
    LavaError::validation(vec![format!(
      "Unsupported os '{os}', expected one of: {}",
      DeploymentData::supported_os().join(", ")
    )])
  })
}

/// Tell every test block where its definitions start in the job-wide
/// numbering used for run ids.
fn number_test_blocks(job: &mut JobDefinition) {
  let mut offset = 0;
  for spec in &mut job.actions {
    if !matches!(spec.section(), Ok(Section::Test)) {
      continue;
    }
    let count = spec
      .parameters
      .get("definitions")
      .and_then(Value::as_array)
      .map_or(0, Vec::len);
    spec.parameters.insert(TESTDEF_OFFSET.to_string(), json!(offset));
    offset += count;
  }
}
