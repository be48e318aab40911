//! The action abstraction and the state it runs against.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lava_config::{DeploymentData, DeviceConfig, DispatcherConfig, JobDefinition, Parameters};
use lava_connection::Connection;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::LavaError;
use crate::events::{JobEvent, JobNotifier};
use crate::pipeline::Pipeline;
use crate::timeout::TimeoutBudget;

/// Name, position and settings common to every action.
#[derive(Debug, Clone)]
pub struct ActionMeta {
  pub name: String,
  pub description: String,
  pub summary: String,
  /// Position in the tree, `1.2.3`. Assigned when added to a pipeline.
  pub level: String,
  pub parameters: Parameters,
  /// Errors found while building the action; kept across validations.
  pub build_errors: Vec<String>,
  /// Errors from the last validation.
  pub errors: Vec<String>,
  /// Own default, replaced by the resolved timeout when added to a pipeline.
  pub timeout: Option<Duration>,
}

impl ActionMeta {
  pub fn new(
    name: impl Into<String>,
    description: impl Into<String>,
    summary: impl Into<String>,
  ) -> Self {
    Self {
      name: name.into(),
      description: description.into(),
      summary: summary.into(),
      level: String::new(),
      parameters: Parameters::new(),
      build_errors: Vec::new(),
      errors: Vec::new(),
      timeout: None,
    }
  }

  pub fn with_parameters(mut self, parameters: Parameters) -> Self {
    self.parameters = parameters;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn valid(&self) -> bool {
    self.build_errors.is_empty() && self.errors.is_empty()
  }

  pub fn param_str(&self, key: &str) -> Option<&str> {
    self.parameters.get(key).and_then(|v| v.as_str())
  }

  /// Resolved timeout, falling back to five minutes for actions never
  /// added to a pipeline.
  pub fn timeout(&self) -> Duration {
    self.timeout.unwrap_or(Duration::from_secs(300))
  }
}

/// Everything an action may consult while building its child pipeline.
///
/// Cheap to clone; configuration is shared and the deployment profile is
/// a plain value picked for this job.
#[derive(Debug, Clone)]
pub struct BuildContext {
  pub job_id: String,
  pub job: Arc<JobDefinition>,
  pub device: Arc<DeviceConfig>,
  pub dispatcher: Arc<DispatcherConfig>,
  pub deployment: DeploymentData,
}

impl BuildContext {
  pub fn new(
    job_id: impl Into<String>,
    job: Arc<JobDefinition>,
    device: Arc<DeviceConfig>,
    dispatcher: Arc<DispatcherConfig>,
    deployment: DeploymentData,
  ) -> Self {
    Self {
      job_id: job_id.into(),
      job,
      device,
      dispatcher,
      deployment,
    }
  }

  /// Scratch directory for this job.
  pub fn job_dir(&self) -> PathBuf {
    self.dispatcher.scratch_dir.join(&self.job_id)
  }

  /// Timeout for an action.
  ///
  /// Job overrides by name win, then device overrides by name, then the
  /// action's own default, then the job-wide action timeout, then the
  /// dispatcher default.
  pub fn action_timeout(&self, name: &str, own: Option<Duration>) -> Duration {
    self
      .job
      .timeouts
      .actions
      .get(name)
      .or_else(|| self.device.timeouts.get(name))
      .map(|spec| spec.as_duration())
      .or(own)
      .or_else(|| self.job.timeouts.action.map(|spec| spec.as_duration()))
      .unwrap_or_else(|| self.dispatcher.action_timeout.as_duration())
  }

  /// Default bound on a single wait for console output.
  pub fn connection_timeout(&self) -> Duration {
    self
      .job
      .timeouts
      .connection
      .unwrap_or(self.dispatcher.connection_timeout)
      .as_duration()
  }
}

/// State handed to every action while the job runs.
pub struct JobState {
  pub job_id: String,
  pub context: Context,
  /// The device console, once a boot action has opened it.
  pub connection: Option<Box<dyn Connection>>,
  pub cancel: CancellationToken,
  pub device: Arc<DeviceConfig>,
  pub dispatcher: Arc<DispatcherConfig>,
  pub notifier: Arc<dyn JobNotifier>,
  /// Whole-job deadline. Every action is bounded by it as well as by its
  /// own timeout.
  pub job_budget: Option<TimeoutBudget>,
}

impl JobState {
  pub fn new(
    job_id: impl Into<String>,
    device: Arc<DeviceConfig>,
    dispatcher: Arc<DispatcherConfig>,
    cancel: CancellationToken,
    notifier: Arc<dyn JobNotifier>,
  ) -> Self {
    Self {
      job_id: job_id.into(),
      context: Context::new(),
      connection: None,
      cancel,
      device,
      dispatcher,
      notifier,
      job_budget: None,
    }
  }

  /// The open connection, or an infrastructure error if none was opened.
  pub fn connection(&mut self) -> Result<&mut (dyn Connection + 'static), LavaError> {
    self
      .connection
      .as_deref_mut()
      .ok_or_else(|| LavaError::infrastructure("no connection to the device"))
  }

  pub fn set_connection(&mut self, connection: Box<dyn Connection>) {
    self.connection = Some(connection);
  }

  pub fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
    self.connection.take()
  }

  pub fn notify(&self, event: JobEvent) {
    self.notifier.notify(event);
  }
}

/// One step of a job.
///
/// An action is built and populated while the pipeline is assembled,
/// validated before anything runs, then run exactly once. Actions that
/// group other actions own a child [`Pipeline`]; the default `run` and
/// `cleanup` simply delegate to it.
#[async_trait]
pub trait Action: Send + Sync {
  fn meta(&self) -> &ActionMeta;

  fn meta_mut(&mut self) -> &mut ActionMeta;

  /// Attach child actions. Called once, after the level and parameters
  /// have been assigned. Problems the job can be told about go into
  /// `meta_mut().build_errors`; an `Err` aborts building the job.
  fn populate(&mut self, _build: &BuildContext) -> Result<(), LavaError> {
    Ok(())
  }

  /// Check parameters. Returns the errors found; must not fail otherwise.
  fn validate(&mut self) -> Vec<String> {
    Vec::new()
  }

  fn pipeline(&self) -> Option<&Pipeline> {
    None
  }

  fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
    None
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    match self.pipeline_mut() {
      Some(pipeline) => pipeline.run(state).await,
      None => Ok(()),
    }
  }

  /// Called in reverse order after a failed or cancelled run.
  async fn cleanup(&mut self, state: &mut JobState) {
    if let Some(pipeline) = self.pipeline_mut() {
      pipeline.cleanup(state).await;
    }
  }

  fn name(&self) -> &str {
    &self.meta().name
  }

  fn level(&self) -> &str {
    &self.meta().level
  }
}
