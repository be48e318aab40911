use std::collections::BTreeMap;

use async_trait::async_trait;
use lava_pipeline::{Action, ActionMeta, JobState, LavaError};
use serde_json::{Value, json};
use tracing::debug;

use crate::keys;

/// Variables from a deploy block's `env_dut` mapping.
pub fn env_vars(value: &Value) -> Result<BTreeMap<String, String>, String> {
  let map = value
    .as_object()
    .ok_or_else(|| "env_dut must be a mapping of variable names to values".to_string())?;
  let mut vars = BTreeMap::new();
  for (key, value) in map {
    let text = match value {
      Value::String(s) => s.clone(),
      Value::Number(n) => n.to_string(),
      Value::Bool(b) => b.to_string(),
      _ => return Err(format!("env_dut value for {key} is not a scalar")),
    };
    vars.insert(key.clone(), text);
  }
  Ok(vars)
}

/// Hands the `env_dut` variables to the test shell.
pub struct DeployDeviceEnvironment {
  meta: ActionMeta,
}

impl DeployDeviceEnvironment {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "deploy-device-env",
        "deploy device environment",
        "deploy device environment",
      ),
    })
  }

  fn vars(&self) -> Result<BTreeMap<String, String>, String> {
    match self.meta.parameters.get("env_dut") {
      Some(value) => env_vars(value),
      None => Ok(BTreeMap::new()),
    }
  }
}

#[async_trait]
impl Action for DeployDeviceEnvironment {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn validate(&mut self) -> Vec<String> {
    self.vars().err().into_iter().collect()
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let vars = self.vars().map_err(LavaError::job)?;
    debug!(count = vars.len(), "device environment");
    state
      .context
      .set(keys::environment(), json!(vars), &self.meta.level);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_env_vars() {
    let vars = env_vars(&json!({"PATH": "/usr/bin", "DEBUG": 1, "QUIET": true})).unwrap();
    assert_eq!(vars["DEBUG"], "1");
    assert_eq!(vars["QUIET"], "true");
    assert!(env_vars(&json!(["a"])).is_err());
    assert_eq!(
      env_vars(&json!({"A": {"b": 1}})).unwrap_err(),
      "env_dut value for A is not a scalar"
    );
  }
}
