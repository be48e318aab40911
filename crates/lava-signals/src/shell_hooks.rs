//! `shell-hooks`: run host-side commands as test runs and test cases start
//! and end.
//!
//! ```yaml
//! hooks:
//!   handler-name: shell-hooks
//!   params:
//!     start_testrun: ./hooks/power-monitor start
//!     end_testcase: ./hooks/collect.sh
//!     timeout: 30
//! ```
//!
//! Commands run through `sh -c` with `LAVA_TEST_RUN_ID`, `LAVA_SIGNAL` and,
//! for test case hooks, `LAVA_TEST_CASE_ID` in the environment.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lava_testdef::TestDefinition;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::SignalError;
use crate::handler::SignalHandler;

const HOOKS: [&str; 4] = ["start_testrun", "end_testrun", "start_testcase", "end_testcase"];
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ShellHooks {
  run_id: String,
  hooks: BTreeMap<String, String>,
  timeout: Duration,
}

impl ShellHooks {
  pub const NAME: &'static str = "shell-hooks";

  pub fn from_params(testdef: &TestDefinition, params: &Map<String, Value>) -> Result<Self, SignalError> {
    let mut hooks = BTreeMap::new();
    let mut timeout = DEFAULT_TIMEOUT;
    for (key, value) in params {
      match (key.as_str(), value) {
        ("timeout", Value::Number(n)) => {
          let secs = n
            .as_u64()
            .ok_or_else(|| SignalError::params(Self::NAME, "timeout must be a positive integer"))?;
          timeout = Duration::from_secs(secs);
        }
        (hook, Value::String(command)) if HOOKS.contains(&hook) => {
          hooks.insert(hook.to_string(), command.clone());
        }
        (other, _) => {
          return Err(SignalError::params(Self::NAME, format!("unexpected parameter '{other}'")));
        }
      }
    }
    Ok(Self {
      run_id: testdef.run_id.clone(),
      hooks,
      timeout,
    })
  }

  async fn run_hook(&self, hook: &str, test_case_id: Option<&str>) -> Result<(), SignalError> {
    let Some(command) = self.hooks.get(hook) else {
      return Ok(());
    };
    let mut cmd = Command::new("sh");
    cmd
      .arg("-c")
      .arg(command)
      .env("LAVA_TEST_RUN_ID", &self.run_id)
      .env("LAVA_SIGNAL", hook)
      .kill_on_drop(true);
    if let Some(id) = test_case_id {
      cmd.env("LAVA_TEST_CASE_ID", id);
    }

    let output = tokio::time::timeout(self.timeout, cmd.output())
      .await
      .map_err(|_| SignalError::HookTimeout {
        hook: hook.to_string(),
        timeout: self.timeout,
      })?
      .map_err(|e| SignalError::hook(hook, e.to_string()))?;

    debug!(
      hook,
      run_id = %self.run_id,
      stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
      "hook output"
    );
    if !output.status.success() {
      return Err(SignalError::hook(
        hook,
        format!(
          "{} exited with {}: {}",
          command,
          output.status,
          String::from_utf8_lossy(&output.stderr).trim_end()
        ),
      ));
    }
    info!(hook, run_id = %self.run_id, "hook completed");
    Ok(())
  }
}

#[async_trait]
impl SignalHandler for ShellHooks {
  async fn start_testrun(&mut self, _run_id: &str) -> Result<(), SignalError> {
    self.run_hook("start_testrun", None).await
  }

  async fn end_testrun(&mut self, _run_id: &str) -> Result<(), SignalError> {
    self.run_hook("end_testrun", None).await
  }

  async fn start_testcase(&mut self, test_case_id: &str) -> Result<(), SignalError> {
    self.run_hook("start_testcase", Some(test_case_id)).await
  }

  async fn end_testcase(&mut self, test_case_id: &str) -> Result<(), SignalError> {
    self.run_hook("end_testcase", Some(test_case_id)).await
  }
}

#[cfg(test)]
mod tests {
  use lava_testdef::TestSource;
  use serde_json::json;

  use super::*;

  fn hooks(params: Value) -> Result<ShellHooks, SignalError> {
    let testdef = TestDefinition::new(1, "net", TestSource::Inline, json!({"run": {"steps": []}}));
    ShellHooks::from_params(&testdef, params.as_object().unwrap())
  }

  #[test]
  fn test_rejects_unknown_parameter() {
    let err = hooks(json!({"on_boot": "true"})).unwrap_err();
    assert!(err.to_string().contains("unexpected parameter 'on_boot'"));
  }

  #[tokio::test]
  async fn test_hook_sees_environment() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("seen");
    let mut handler = hooks(json!({
      "end_testcase": format!("echo \"$LAVA_TEST_RUN_ID $LAVA_TEST_CASE_ID\" > {}", out.display())
    }))
    .unwrap();

    handler.start_testrun("1_net").await.unwrap();
    handler.end_testcase("ping").await.unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "1_net ping\n");
  }

  #[tokio::test]
  async fn test_failing_hook_is_error() {
    let mut handler = hooks(json!({"start_testrun": "exit 3"})).unwrap();
    let err = handler.start_testrun("1_net").await.unwrap_err();
    assert!(matches!(err, SignalError::Hook { ref hook, .. } if hook == "start_testrun"));
  }
}
