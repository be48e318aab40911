//! Ordered, nestable sequence of actions.

use lava_config::Parameters;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio::time::error::Elapsed;
use tracing::{Instrument, error, info, info_span, warn};

use crate::action::{Action, ActionMeta, BuildContext, JobState};
use crate::context::{ActionRecord, ActionStatus, Failure};
use crate::error::LavaError;
use crate::events::JobEvent;

/// Serializable shape of a pipeline, used to compare pipelines and to
/// show what a job will do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescription {
  pub level: String,
  pub name: String,
  pub description: String,
  pub summary: String,
  pub timeout: u64,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<ActionDescription>,
}

/// A list of actions run in order. Actions may own child pipelines, so the
/// whole job is a tree.
#[derive(Default)]
pub struct Pipeline {
  /// Level of the owning action, `None` for the root.
  parent_level: Option<String>,
  parameters: Parameters,
  actions: Vec<Box<dyn Action>>,
}

impl Pipeline {
  pub fn root() -> Self {
    Self::default()
  }

  /// A child pipeline inheriting the parent's level and parameters.
  pub fn child(parent: &ActionMeta) -> Self {
    Self {
      parent_level: Some(parent.level.clone()),
      parameters: parent.parameters.clone(),
      actions: Vec::new(),
    }
  }

  pub fn actions(&self) -> &[Box<dyn Action>] {
    &self.actions
  }

  pub fn len(&self) -> usize {
    self.actions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.actions.is_empty()
  }

  /// Append an action, assign its level, merge parameters, resolve its
  /// timeout, then let it populate its own children.
  pub fn add_action(
    &mut self,
    mut action: Box<dyn Action>,
    build: &BuildContext,
  ) -> Result<(), LavaError> {
    let position = self.actions.len() + 1;
    let meta = action.meta_mut();
    meta.level = match &self.parent_level {
      Some(parent) => format!("{parent}.{position}"),
      None => position.to_string(),
    };

    let mut parameters = self.parameters.clone();
    for (key, value) in std::mem::take(&mut meta.parameters) {
      parameters.insert(key, value);
    }
    meta.parameters = parameters;
    meta.timeout = Some(build.action_timeout(&meta.name, meta.timeout));

    action.populate(build)?;
    self.actions.push(action);
    Ok(())
  }

  /// Validate every action, depth first, pre-order.
  ///
  /// Errors are recomputed on each call and all of them are returned;
  /// an invalid action never hides errors in its siblings.
  pub fn validate(&mut self) -> Vec<String> {
    let mut errors = Vec::new();
    for action in &mut self.actions {
      let found = action.validate();
      let meta = action.meta_mut();
      meta.errors = found;
      errors.extend(meta.build_errors.iter().cloned());
      errors.extend(meta.errors.iter().cloned());

      if let Some(pipeline) = action.pipeline_mut() {
        errors.extend(pipeline.validate());
      }
    }
    errors
  }

  /// Run every action in order.
  ///
  /// Each action is bounded by its timeout and interrupted by
  /// cancellation. The first error is recorded and returned without
  /// running the remaining actions.
  pub async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    for action in &mut self.actions {
      if state.cancel.is_cancelled() {
        warn!(job_id = %state.job_id, next = %action.name(), "job cancelled between actions");
        return Err(LavaError::Cancelled);
      }

      let level = action.level().to_string();
      let name = action.name().to_string();
      let limit = action.meta().timeout();
      let cancel = state.cancel.clone();
      let started = Instant::now();
      // The job deadline is absolute, so nested actions share it exactly
      // and the innermost running action is the one that reports it.
      let own = started.checked_add(limit);
      let (deadline, job_limit) = match (state.job_budget, own) {
        (Some(budget), Some(own)) if budget.deadline() >= own => (Some(own), None),
        (Some(budget), _) => (Some(budget.deadline()), Some(budget.total())),
        (None, own) => (own, None),
      };

      info!(job_id = %state.job_id, level = %level, action = %name, "action_started");
      state.notify(JobEvent::ActionStarted {
        job_id: state.job_id.clone(),
        level: level.clone(),
        name: name.clone(),
      });

      let span = info_span!("action", level = %level, name = %name);
      let result = async {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => Err(LavaError::Cancelled),
          outcome = run_until(deadline, action.run(state)) => match outcome {
            Ok(result) => result,
            Err(_) => match job_limit {
              Some(total) => Err(LavaError::job_timeout(total)),
              None => Err(LavaError::action_timeout(&name, limit)),
            },
          },
        }
      }
      .instrument(span)
      .await;

      let duration_ms = started.elapsed().as_millis() as u64;
      match result {
        Ok(()) => {
          info!(job_id = %state.job_id, level = %level, action = %name, duration_ms, "action_completed");
          state.context.record_action(ActionRecord {
            level: level.clone(),
            name: name.clone(),
            status: ActionStatus::Pass,
            duration_ms,
            error: None,
          });
          state.notify(JobEvent::ActionCompleted {
            job_id: state.job_id.clone(),
            level,
            name,
            duration_ms,
          });
        }
        Err(e) => {
          error!(job_id = %state.job_id, level = %level, action = %name, error = %e, "action_failed");
          state.context.record_action(ActionRecord {
            level: level.clone(),
            name: name.clone(),
            status: ActionStatus::Fail,
            duration_ms,
            error: Some(e.to_string()),
          });
          state.context.record_failure(Failure {
            level: level.clone(),
            name: name.clone(),
            description: action.meta().description.clone(),
            kind: e.kind(),
            error: e.to_string(),
          });
          state.notify(JobEvent::ActionFailed {
            job_id: state.job_id.clone(),
            level,
            name,
            error: e.to_string(),
          });
          return Err(e);
        }
      }
    }
    Ok(())
  }

  /// Give every action a chance to release resources, last action first.
  pub async fn cleanup(&mut self, state: &mut JobState) {
    for action in self.actions.iter_mut().rev() {
      action.cleanup(state).await;
    }
  }

  pub fn describe(&self) -> Vec<ActionDescription> {
    self
      .actions
      .iter()
      .map(|action| {
        let meta = action.meta();
        ActionDescription {
          level: meta.level.clone(),
          name: meta.name.clone(),
          description: meta.description.clone(),
          summary: meta.summary.clone(),
          timeout: meta.timeout().as_secs(),
          children: action.pipeline().map(Pipeline::describe).unwrap_or_default(),
        }
      })
      .collect()
  }

  /// Names of every action in the tree, pre-order.
  pub fn names(&self) -> Vec<String> {
    let mut names = Vec::new();
    for action in &self.actions {
      names.push(action.name().to_string());
      if let Some(pipeline) = action.pipeline() {
        names.extend(pipeline.names());
      }
    }
    names
  }

  /// First action with this name anywhere in the tree.
  pub fn find(&self, name: &str) -> Option<&dyn Action> {
    for action in &self.actions {
      if action.name() == name {
        return Some(action.as_ref());
      }
      if let Some(found) = action.pipeline().and_then(|p| p.find(name)) {
        return Some(found);
      }
    }
    None
  }
}

/// Await `future` until `deadline`, or without bound when there is none.
async fn run_until<F: Future>(deadline: Option<Instant>, future: F) -> Result<F::Output, Elapsed> {
  match deadline {
    Some(deadline) => tokio::time::timeout_at(deadline, future).await,
    None => Ok(future.await),
  }
}
