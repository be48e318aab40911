use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use lava_pipeline::{Context, ResultValue, TestResult};
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::handler::SignalHandler;

/// Suite for results reported outside any test run.
const DISPATCHER_SUITE: &str = "lava";

/// Longest any single handler hook may hold up the ACK.
const HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the director is in the test-shell protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorState {
  /// Between test runs.
  Waiting,
  /// Inside a STARTRUN/ENDRUN pair.
  Running { run_id: String, name: String },
  /// Every expected run has ended.
  Done,
}

/// What a signal did, for the caller driving the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
  RunStarted(String),
  RunEnded(String),
  Handled,
  Ignored,
}

/// Tracks test runs on the target and routes signals to the handler of
/// the active run.
pub struct SignalDirector {
  state: DirectorState,
  handlers: BTreeMap<String, Box<dyn SignalHandler>>,
  expected_runs: usize,
  finished_runs: Vec<String>,
  test_case: Option<String>,
  hook_timeout: Duration,
}

impl SignalDirector {
  /// A director expecting `expected_runs` STARTRUN/ENDRUN pairs.
  pub fn new(expected_runs: usize) -> Self {
    Self {
      state: DirectorState::Waiting,
      handlers: BTreeMap::new(),
      expected_runs,
      finished_runs: Vec::new(),
      test_case: None,
      hook_timeout: HOOK_TIMEOUT,
    }
  }

  pub fn with_handlers(mut self, handlers: BTreeMap<String, Box<dyn SignalHandler>>) -> Self {
    self.handlers = handlers;
    self
  }

  pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
    self.hook_timeout = timeout;
    self
  }

  pub fn state(&self) -> &DirectorState {
    &self.state
  }

  pub fn finished_runs(&self) -> &[String] {
    &self.finished_runs
  }

  pub fn current_run(&self) -> Option<&str> {
    match &self.state {
      DirectorState::Running { run_id, .. } => Some(run_id),
      _ => None,
    }
  }

  /// Handle one `<LAVA_SIGNAL_{name} {params}>` marker.
  ///
  /// Never fails: malformed signals and handler errors are logged.
  /// Handler hooks that hang or panic are cut off and logged the same way.
  pub async fn signal(&mut self, name: &str, params: &[&str], ctx: &mut Context) -> SignalOutcome {
    debug!(signal = name, ?params, state = ?self.state, "signal received");
    let limit = self.hook_timeout;
    match name {
      "STARTRUN" => self.start_run(params).await,
      "ENDRUN" => self.end_run(params).await,
      "STARTTC" => {
        let Some(id) = params.first() else {
          warn!("STARTTC without a test case id");
          return SignalOutcome::Ignored;
        };
        self.test_case = Some(id.to_string());
        if let Some(handler) = self.active_handler() {
          log_failure(name, guarded("start_testcase", limit, handler.start_testcase(id)).await);
        }
        SignalOutcome::Handled
      }
      "ENDTC" => {
        let Some(id) = params.first() else {
          warn!("ENDTC without a test case id");
          return SignalOutcome::Ignored;
        };
        self.test_case = None;
        if let Some(handler) = self.active_handler() {
          log_failure(name, guarded("end_testcase", limit, handler.end_testcase(id)).await);
        }
        SignalOutcome::Handled
      }
      "TESTCASE" => self.test_case_result(params, ctx),
      other => match self.active_handler() {
        Some(handler) => {
          log_failure(other, guarded("custom_signal", limit, handler.custom_signal(other, params)).await);
          SignalOutcome::Handled
        }
        None => {
          warn!(signal = other, "unknown signal ignored");
          SignalOutcome::Ignored
        }
      },
    }
  }

  async fn start_run(&mut self, params: &[&str]) -> SignalOutcome {
    let [run_id, name, ..] = params else {
      warn!(?params, "STARTRUN needs a run id and a name");
      return SignalOutcome::Ignored;
    };
    if let DirectorState::Running { run_id: active, .. } = &self.state {
      warn!(active = %active, run_id, "STARTRUN while a run is active");
    }
    info!(run_id, name, "test run started");
    self.state = DirectorState::Running {
      run_id: run_id.to_string(),
      name: name.to_string(),
    };
    let limit = self.hook_timeout;
    if let Some(handler) = self.handlers.get_mut(*run_id) {
      log_failure("STARTRUN", guarded("start_testrun", limit, handler.start_testrun(run_id)).await);
    }
    SignalOutcome::RunStarted(run_id.to_string())
  }

  async fn end_run(&mut self, params: &[&str]) -> SignalOutcome {
    let run_id = params
      .first()
      .map(|s| s.to_string())
      .or_else(|| self.current_run().map(str::to_string));
    let Some(run_id) = run_id else {
      warn!("ENDRUN outside a test run");
      return SignalOutcome::Ignored;
    };
    let limit = self.hook_timeout;
    if let Some(handler) = self.handlers.get_mut(&run_id) {
      log_failure("ENDRUN", guarded("end_testrun", limit, handler.end_testrun(&run_id)).await);
    }
    self.finished_runs.push(run_id.clone());
    self.test_case = None;
    self.state = if self.finished_runs.len() >= self.expected_runs {
      DirectorState::Done
    } else {
      DirectorState::Waiting
    };
    info!(run_id = %run_id, state = ?self.state, "test run ended");
    SignalOutcome::RunEnded(run_id)
  }

  /// Give the run's handler a look at the run's results once they are all
  /// recorded. The handler may add details to the run's [`RunInfo`].
  ///
  /// [`RunInfo`]: lava_pipeline::RunInfo
  pub async fn postprocess_run(&mut self, run_id: &str, ctx: &mut Context) {
    let limit = self.hook_timeout;
    let Some(handler) = self.handlers.get_mut(run_id) else {
      return;
    };
    let results: Vec<TestResult> = ctx.results_for(run_id).cloned().collect();
    let info = ctx.run_info_mut(run_id);
    let hook = handler.postprocess_test_run(run_id, &results, info);
    log_failure("postprocess", guarded("postprocess_test_run", limit, hook).await);
  }

  /// `TEST_CASE_ID=.. RESULT=.. [MEASUREMENT=..] [UNITS=..]` from
  /// `lava-test-case`.
  fn test_case_result(&self, params: &[&str], ctx: &mut Context) -> SignalOutcome {
    let fields: BTreeMap<&str, &str> = params.iter().filter_map(|p| p.split_once('=')).collect();
    let (Some(id), Some(word)) = (fields.get("TEST_CASE_ID"), fields.get("RESULT")) else {
      warn!(?params, "TESTCASE without TEST_CASE_ID or RESULT");
      return SignalOutcome::Ignored;
    };
    let Some(result) = ResultValue::parse(word) else {
      warn!(test_case_id = id, result = word, "TESTCASE with unknown result");
      return SignalOutcome::Ignored;
    };
    let suite = self.current_run().unwrap_or(DISPATCHER_SUITE);
    let mut test_result = TestResult::new(suite, *id, result);
    if let Some(measurement) = fields.get("MEASUREMENT") {
      test_result = test_result.with_measurement(*measurement, fields.get("UNITS").map(|u| u.to_string()));
    }
    info!(suite, test_case_id = id, result = result.as_str(), "test case result");
    ctx.add_result(test_result);
    SignalOutcome::Handled
  }

  fn active_handler(&mut self) -> Option<&mut Box<dyn SignalHandler>> {
    let DirectorState::Running { run_id, .. } = &self.state else {
      return None;
    };
    self.handlers.get_mut(run_id)
  }
}

/// Await a handler hook for at most `limit`. A panic inside the hook
/// becomes a hook error.
async fn guarded<F>(hook: &str, limit: Duration, future: F) -> Result<(), SignalError>
where
  F: Future<Output = Result<(), SignalError>>,
{
  match tokio::time::timeout(limit, AssertUnwindSafe(future).catch_unwind()).await {
    Ok(Ok(result)) => result,
    Ok(Err(panic)) => Err(SignalError::hook(hook, format!("panicked: {}", panic_message(&*panic)))),
    Err(_) => Err(SignalError::HookTimeout {
      hook: hook.to_string(),
      timeout: limit,
    }),
  }
}

fn panic_message<'a>(panic: &'a (dyn Any + Send + 'static)) -> &'a str {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message
  } else {
    "unknown panic"
  }
}

fn log_failure(signal: &str, result: Result<(), SignalError>) {
  if let Err(e) = result {
    warn!(signal, error = %e, "signal handler failed");
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use async_trait::async_trait;

  use lava_pipeline::RunInfo;

  use super::*;

  #[derive(Default)]
  struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
  }

  #[async_trait]
  impl SignalHandler for Recorder {
    async fn start_testrun(&mut self, run_id: &str) -> Result<(), SignalError> {
      self.calls.lock().unwrap().push(format!("start {run_id}"));
      Ok(())
    }

    async fn start_testcase(&mut self, id: &str) -> Result<(), SignalError> {
      self.calls.lock().unwrap().push(format!("tc {id}"));
      Err(SignalError::hook("start_testcase", "boom"))
    }

    async fn end_testrun(&mut self, run_id: &str) -> Result<(), SignalError> {
      self.calls.lock().unwrap().push(format!("end {run_id}"));
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_state_machine() {
    let mut ctx = Context::new();
    let mut director = SignalDirector::new(2);
    assert_eq!(director.state(), &DirectorState::Waiting);

    let outcome = director.signal("STARTRUN", &["0_smoke", "smoke"], &mut ctx).await;
    assert_eq!(outcome, SignalOutcome::RunStarted("0_smoke".into()));
    assert_eq!(director.current_run(), Some("0_smoke"));

    director.signal("ENDRUN", &["0_smoke", "smoke"], &mut ctx).await;
    assert_eq!(director.state(), &DirectorState::Waiting);

    director.signal("STARTRUN", &["1_net", "net"], &mut ctx).await;
    director.signal("ENDRUN", &["1_net", "net"], &mut ctx).await;
    assert_eq!(director.state(), &DirectorState::Done);
    assert_eq!(director.finished_runs(), ["0_smoke", "1_net"]);
  }

  #[tokio::test]
  async fn test_testcase_recorded_under_active_run() {
    let mut ctx = Context::new();
    let mut director = SignalDirector::new(1);
    director.signal("STARTRUN", &["0_smoke", "smoke"], &mut ctx).await;
    director
      .signal(
        "TESTCASE",
        &["TEST_CASE_ID=boot-time", "RESULT=pass", "MEASUREMENT=12.5", "UNITS=s"],
        &mut ctx,
      )
      .await;
    let ignored = director.signal("TESTCASE", &["RESULT=pass"], &mut ctx).await;
    assert_eq!(ignored, SignalOutcome::Ignored);

    assert_eq!(ctx.results().len(), 1);
    let result = &ctx.results()[0];
    assert_eq!(result.suite, "0_smoke");
    assert_eq!(result.test_case_id, "boot-time");
    assert_eq!(result.result, ResultValue::Pass);
    assert_eq!(result.measurement.as_deref(), Some("12.5"));
    assert_eq!(result.units.as_deref(), Some("s"));
  }

  #[tokio::test]
  async fn test_handler_errors_are_not_propagated() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut handlers: BTreeMap<String, Box<dyn SignalHandler>> = BTreeMap::new();
    handlers.insert("0_smoke".into(), Box::new(Recorder { calls: calls.clone() }));
    let mut director = SignalDirector::new(1).with_handlers(handlers);
    let mut ctx = Context::new();

    director.signal("STARTRUN", &["0_smoke", "smoke"], &mut ctx).await;
    let outcome = director.signal("STARTTC", &["ping"], &mut ctx).await;
    assert_eq!(outcome, SignalOutcome::Handled);
    director.signal("ENDRUN", &["0_smoke", "smoke"], &mut ctx).await;

    assert_eq!(*calls.lock().unwrap(), vec!["start 0_smoke", "tc ping", "end 0_smoke"]);
    assert_eq!(director.state(), &DirectorState::Done);
  }

  /// Hangs on STARTRUN and panics on STARTTC.
  struct Misbehaving;

  #[async_trait]
  impl SignalHandler for Misbehaving {
    async fn start_testrun(&mut self, _run_id: &str) -> Result<(), SignalError> {
      std::future::pending::<()>().await;
      Ok(())
    }

    async fn start_testcase(&mut self, _id: &str) -> Result<(), SignalError> {
      panic!("handler bug");
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_hanging_or_panicking_hook_does_not_block_signals() {
    let mut handlers: BTreeMap<String, Box<dyn SignalHandler>> = BTreeMap::new();
    handlers.insert("0_smoke".into(), Box::new(Misbehaving));
    let mut director = SignalDirector::new(1)
      .with_handlers(handlers)
      .with_hook_timeout(Duration::from_secs(5));
    let mut ctx = Context::new();

    let started = tokio::time::Instant::now();
    let outcome = director.signal("STARTRUN", &["0_smoke", "smoke"], &mut ctx).await;
    assert_eq!(outcome, SignalOutcome::RunStarted("0_smoke".into()));
    assert!(started.elapsed() >= Duration::from_secs(5));

    let outcome = director.signal("STARTTC", &["ping"], &mut ctx).await;
    assert_eq!(outcome, SignalOutcome::Handled);
    director
      .signal("TESTCASE", &["TEST_CASE_ID=ping", "RESULT=pass"], &mut ctx)
      .await;
    director.signal("ENDRUN", &["0_smoke", "smoke"], &mut ctx).await;

    assert_eq!(ctx.results().len(), 1);
    assert_eq!(director.state(), &DirectorState::Done);
  }

  /// Tags the run with how many results it produced.
  struct Counter;

  #[async_trait]
  impl SignalHandler for Counter {
    async fn postprocess_test_run(
      &mut self,
      _run_id: &str,
      results: &[TestResult],
      info: &mut RunInfo,
    ) -> Result<(), SignalError> {
      info.attributes.insert("result-count".into(), results.len().to_string());
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_postprocess_sees_only_its_run() {
    let mut handlers: BTreeMap<String, Box<dyn SignalHandler>> = BTreeMap::new();
    handlers.insert("1_net".into(), Box::new(Counter));
    let mut director = SignalDirector::new(2).with_handlers(handlers);
    let mut ctx = Context::new();

    for (run_id, name, cases) in [("0_smoke", "smoke", 3), ("1_net", "net", 2)] {
      director.signal("STARTRUN", &[run_id, name], &mut ctx).await;
      for i in 0..cases {
        let id = format!("TEST_CASE_ID=case{i}");
        director.signal("TESTCASE", &[id.as_str(), "RESULT=pass"], &mut ctx).await;
      }
      director.signal("ENDRUN", &[run_id, name], &mut ctx).await;
      director.postprocess_run(run_id, &mut ctx).await;
    }

    assert!(ctx.run_info("0_smoke").is_none());
    let info = ctx.run_info("1_net").unwrap();
    assert_eq!(info.attributes.get("result-count").map(String::as_str), Some("2"));
  }

  #[tokio::test]
  async fn test_unknown_signal_ignored() {
    let mut ctx = Context::new();
    let mut director = SignalDirector::new(1);
    let outcome = director.signal("REBOOT", &["now"], &mut ctx).await;
    assert_eq!(outcome, SignalOutcome::Ignored);
    assert_eq!(director.state(), &DirectorState::Waiting);
  }
}
