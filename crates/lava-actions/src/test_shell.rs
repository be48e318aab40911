//! The test section: run the test definitions on the booted target and
//! collect what they report.

use async_trait::async_trait;
use lava_config::{DeploymentData, DeviceConfig, Parameters, Section, StartupStyle};
use lava_pipeline::{
  Acceptance, Action, ActionMeta, BuildContext, JobEvent, JobState, LavaError, Strategy,
};
use lava_signals::{HandlerRegistry, SessionOutcome, SignalDirector, TestShellSession};
use lava_testdef::{TestDefinition, TestSource};
use serde_json::Value;
use tracing::info;

use crate::keys;
use crate::testdef::{DefinitionEntry, definition_entries};

/// Parameter the parser adds to every test block: how many definitions
/// earlier test blocks declared.
pub const TESTDEF_OFFSET: &str = "testdef_offset";

pub struct TestShellStrategy;

impl Strategy for TestShellStrategy {
  fn name(&self) -> &'static str {
    "lava-test-shell"
  }

  fn section(&self) -> Section {
    Section::Test
  }

  fn accepts(&self, _device: &DeviceConfig, parameters: &Parameters) -> Acceptance {
    if parameters.contains_key("definitions") {
      Acceptance::accept()
    } else {
      Acceptance::reject("\"definitions\" is not in the test parameters")
    }
  }

  fn action(&self, parameters: &Parameters) -> Box<dyn Action> {
    TestShellAction::new(parameters.clone(), HandlerRegistry::with_builtins())
  }
}

/// Reads the console while the runner works through this block's
/// definitions, answering every signal and recording results.
pub struct TestShellAction {
  meta: ActionMeta,
  handlers: HandlerRegistry,
  runs: Vec<DefinitionEntry>,
  deployment: DeploymentData,
  start_runner: bool,
}

impl TestShellAction {
  pub fn new(parameters: Parameters, handlers: HandlerRegistry) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "lava-test-shell",
        "Executing lava-test-runner",
        "Lava Test Shell",
      )
      .with_parameters(parameters),
      handlers,
      runs: Vec::new(),
      deployment: DeploymentData::default(),
      start_runner: false,
    })
  }

  fn declared(&self) -> usize {
    self
      .meta
      .parameters
      .get("definitions")
      .and_then(Value::as_array)
      .map_or(0, Vec::len)
  }

  /// Inline definitions are known before anything runs, so their hooks
  /// can be checked up front.
  fn inline_definitions(&self) -> Vec<TestDefinition> {
    self
      .runs
      .iter()
      .filter(|run| run.parameters.get("from").and_then(Value::as_str) == Some("inline"))
      .filter_map(|run| {
        let document = run.parameters.get("repository")?.clone();
        Some(TestDefinition::new(run.index, run.name.clone(), TestSource::Inline, document))
      })
      .collect()
  }

  async fn launch_runner(&self, state: &mut JobState) -> Result<(), LavaError> {
    let env = state
      .context
      .get(&keys::environment())
      .and_then(Value::as_object)
      .cloned()
      .unwrap_or_default();
    let connection = state.connection()?;
    for (key, value) in &env {
      if let Some(value) = value.as_str() {
        let value = value.replace('\'', r"'\''");
        connection.send_line(&format!("export {key}='{value}'")).await?;
      }
    }
    connection
      .send_line(&format!("{}/bin/lava-test-runner", self.deployment.lava_test_dir))
      .await?;
    info!(exports = env.len(), "test_runner_started");
    Ok(())
  }
}

#[async_trait]
impl Action for TestShellAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let offset = self
      .meta
      .parameters
      .get(TESTDEF_OFFSET)
      .and_then(Value::as_u64)
      .unwrap_or(0) as usize;
    self.runs = definition_entries(&build.job)
      .into_iter()
      .skip(offset)
      .take(self.declared())
      .collect();
    self.deployment = build.deployment.clone();
    self.start_runner = self.deployment.startup == StartupStyle::Console && offset == 0;
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    if self.declared() == 0 {
      return vec!["\"definitions\" must be a non-empty list".to_string()];
    }
    self.handlers.validate(&self.inline_definitions())
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let testdefs = self
      .runs
      .iter()
      .map(|run| keys::stored_definition(&state.context, &run.run_id))
      .collect::<Result<Vec<_>, _>>()?;

    let director = SignalDirector::new(testdefs.len()).with_handlers(self.handlers.handlers_for(&testdefs));
    let mut session = TestShellSession::new(director);
    for testdef in &testdefs {
      session = session.with_fixup(testdef.run_id.clone(), testdef.pattern());
    }

    if self.start_runner {
      self.launch_runner(state).await?;
    }

    let timeout = self.meta.timeout();
    let before = state.context.results().len();
    let connection = state
      .connection
      .as_deref_mut()
      .ok_or_else(|| LavaError::infrastructure("no connection to the device"))?;
    let outcome = session
      .run(connection, &mut state.context, timeout, &state.cancel)
      .await;

    let recorded = state.context.results()[before..].to_vec();
    for result in recorded {
      state.notify(JobEvent::TestResult {
        job_id: state.job_id.clone(),
        result,
      });
    }

    match outcome? {
      SessionOutcome::Completed => {
        info!(
          runs = session.director().finished_runs().len(),
          acks = session.acks(),
          "test_shell_completed"
        );
        Ok(())
      }
      SessionOutcome::TimedOut => Err(LavaError::timeout(format!(
        "lava-test-shell timed out after {}s",
        timeout.as_secs()
      ))),
      SessionOutcome::ConnectionLost => Err(LavaError::infrastructure(
        "connection to the device closed during the test shell",
      )),
    }
  }
}
