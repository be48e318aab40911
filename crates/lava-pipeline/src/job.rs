//! Job: one root pipeline run against one device.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lava_config::{DeviceConfig, DispatcherConfig, JobDefinition};
use lava_connection::Connection;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::action::JobState;
use crate::context::Context;
use crate::events::{JobEvent, JobNotifier, NoopNotifier};
use crate::pipeline::{ActionDescription, Pipeline};
use crate::timeout::TimeoutBudget;

/// Final status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  /// Everything ran and no test case failed.
  Pass,
  /// Everything ran but at least one test case failed.
  Fail,
  /// The job did not run to the end.
  Incomplete,
  Canceled,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Pass => "pass",
      JobStatus::Fail => "fail",
      JobStatus::Incomplete => "incomplete",
      JobStatus::Canceled => "canceled",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What a finished job leaves behind.
#[derive(Debug)]
pub struct JobOutcome {
  pub job_id: String,
  pub status: JobStatus,
  /// Validation errors, or the run-time error that ended the job.
  pub errors: Vec<String>,
  pub context: Context,
  pub duration: Duration,
}

/// A job ready to run: definition, device and the assembled pipeline.
pub struct Job {
  id: String,
  definition: Arc<JobDefinition>,
  device: Arc<DeviceConfig>,
  dispatcher: Arc<DispatcherConfig>,
  pipeline: Pipeline,
  notifier: Arc<dyn JobNotifier>,
  /// Problems found while assembling the pipeline, such as blocks no
  /// strategy accepted.
  build_errors: Vec<String>,
}

impl Job {
  pub fn new(
    id: impl Into<String>,
    definition: Arc<JobDefinition>,
    device: Arc<DeviceConfig>,
    dispatcher: Arc<DispatcherConfig>,
    pipeline: Pipeline,
  ) -> Self {
    Self {
      id: id.into(),
      definition,
      device,
      dispatcher,
      pipeline,
      notifier: Arc::new(NoopNotifier),
      build_errors: Vec::new(),
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_build_errors(mut self, errors: Vec<String>) -> Self {
    self.build_errors = errors;
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn definition(&self) -> &JobDefinition {
    &self.definition
  }

  pub fn pipeline(&self) -> &Pipeline {
    &self.pipeline
  }

  /// Every validation error: assembly problems first, then the pipeline.
  pub fn validate(&mut self) -> Vec<String> {
    let mut errors = self.build_errors.clone();
    errors.extend(self.pipeline.validate());
    errors
  }

  pub fn describe(&self) -> Vec<ActionDescription> {
    self.pipeline.describe()
  }

  fn job_timeout(&self) -> Duration {
    self
      .definition
      .timeouts
      .job
      .unwrap_or(self.dispatcher.job_timeout)
      .as_duration()
  }

  /// Validate, then run the pipeline to completion or to the first error.
  ///
  /// An optional pre-opened connection is handed to the actions; boot
  /// actions normally open their own. After a failure every action's
  /// cleanup runs. Partial results are always kept in the outcome.
  #[instrument(name = "job_run", skip_all, fields(job_id = %self.id, job_name = %self.definition.job_name))]
  pub async fn run(
    mut self,
    connection: Option<Box<dyn Connection>>,
    cancel: CancellationToken,
  ) -> JobOutcome {
    let started = Instant::now();
    info!(job_id = %self.id, job_name = %self.definition.job_name, "job_started");
    self.notifier.notify(JobEvent::JobStarted {
      job_id: self.id.clone(),
      job_name: self.definition.job_name.clone(),
    });

    let mut state = JobState::new(
      self.id.clone(),
      self.device.clone(),
      self.dispatcher.clone(),
      cancel.clone(),
      self.notifier.clone(),
    );
    state.connection = connection;
    state
      .context
      .metadata
      .extend(self.definition.metadata.clone());

    let errors = self.validate();
    if !errors.is_empty() {
      error!(job_id = %self.id, errors = ?errors, "job_invalid");
      return self.finish(state, JobStatus::Incomplete, errors, started);
    }

    state.job_budget = Some(TimeoutBudget::new(self.job_timeout()));
    let result = self.pipeline.run(&mut state).await;

    let (status, errors) = match result {
      Ok(()) if state.context.has_failed_tests() => (JobStatus::Fail, Vec::new()),
      Ok(()) => (JobStatus::Pass, Vec::new()),
      Err(e) => {
        warn!(job_id = %self.id, error = %e, "running cleanup after failure");
        self.pipeline.cleanup(&mut state).await;
        (e.status(), vec![e.to_string()])
      }
    };

    self.finish(state, status, errors, started)
  }

  fn finish(
    &self,
    mut state: JobState,
    status: JobStatus,
    errors: Vec<String>,
    started: Instant,
  ) -> JobOutcome {
    // Whatever is still open belongs to this job.
    drop(state.take_connection());
    info!(job_id = %self.id, status = %status, "job_finished");
    self.notifier.notify(JobEvent::JobFinished {
      job_id: self.id.clone(),
      status,
    });
    JobOutcome {
      job_id: self.id.clone(),
      status,
      errors,
      context: state.context,
      duration: started.elapsed(),
    }
  }
}
