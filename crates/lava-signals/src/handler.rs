use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lava_pipeline::{RunInfo, TestResult};
use lava_testdef::TestDefinition;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::SignalError;
use crate::shell_hooks::ShellHooks;

/// Per test definition hook into the signal protocol.
///
/// One handler is created for each definition that declares a `hooks`
/// block and lives for that definition's run. Every hook defaults to a
/// no-op.
#[async_trait]
pub trait SignalHandler: Send {
  async fn start_testrun(&mut self, _run_id: &str) -> Result<(), SignalError> {
    Ok(())
  }

  async fn end_testrun(&mut self, _run_id: &str) -> Result<(), SignalError> {
    Ok(())
  }

  async fn start_testcase(&mut self, _test_case_id: &str) -> Result<(), SignalError> {
    Ok(())
  }

  async fn end_testcase(&mut self, _test_case_id: &str) -> Result<(), SignalError> {
    Ok(())
  }

  /// Any signal name the director does not know itself.
  async fn custom_signal(&mut self, _name: &str, _params: &[&str]) -> Result<(), SignalError> {
    Ok(())
  }

  /// Called once a run's results are all recorded, before they are
  /// reported. `info` is what gets reported beside them.
  async fn postprocess_test_run(
    &mut self,
    _run_id: &str,
    _results: &[TestResult],
    _info: &mut RunInfo,
  ) -> Result<(), SignalError> {
    Ok(())
  }
}

/// Builds a handler for a definition from its `hooks.params`.
pub type HandlerFactory = Arc<
  dyn Fn(&TestDefinition, &Map<String, Value>) -> Result<Box<dyn SignalHandler>, SignalError>
    + Send
    + Sync,
>;

/// Signal handlers by the name test definitions use in
/// `hooks.handler-name`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the handlers shipped with the dispatcher.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register(ShellHooks::NAME, |testdef, params| {
      ShellHooks::from_params(testdef, params).map(|h| Box::new(h) as Box<dyn SignalHandler>)
    });
    registry
  }

  pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
  where
    F: Fn(&TestDefinition, &Map<String, Value>) -> Result<Box<dyn SignalHandler>, SignalError>
      + Send
      + Sync
      + 'static,
  {
    self.factories.insert(name.into(), Arc::new(factory));
  }

  pub fn contains(&self, name: &str) -> bool {
    self.factories.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.factories.keys().map(String::as_str)
  }

  /// Handler for a definition; `None` when it declares no hooks.
  pub fn create(&self, testdef: &TestDefinition) -> Result<Option<Box<dyn SignalHandler>>, SignalError> {
    let Some((name, params)) = testdef.hooks() else {
      return Ok(None);
    };
    let factory = self
      .factories
      .get(name)
      .ok_or_else(|| SignalError::UnknownHandler(name.to_string()))?;
    let empty = Map::new();
    factory(testdef, params.unwrap_or(&empty)).map(Some)
  }

  /// Handlers keyed by run id. A handler that cannot be created is logged
  /// and left out; the definition still runs.
  pub fn handlers_for(&self, testdefs: &[TestDefinition]) -> BTreeMap<String, Box<dyn SignalHandler>> {
    let mut handlers = BTreeMap::new();
    for testdef in testdefs {
      match self.create(testdef) {
        Ok(Some(handler)) => {
          debug!(run_id = %testdef.run_id, "signal handler loaded");
          handlers.insert(testdef.run_id.clone(), handler);
        }
        Ok(None) => {}
        Err(e) => warn!(run_id = %testdef.run_id, error = %e, "loading signal handler failed"),
      }
    }
    handlers
  }

  /// Errors for definitions naming a handler that is not registered.
  pub fn validate(&self, testdefs: &[TestDefinition]) -> Vec<String> {
    testdefs
      .iter()
      .filter_map(|t| t.hooks().map(|(name, _)| (t, name)))
      .filter(|(_, name)| !self.contains(name))
      .map(|(t, name)| format!("Test definition {} uses unknown signal handler '{name}'", t.name))
      .collect()
  }
}

impl std::fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandlerRegistry")
      .field("handlers", &self.factories.keys().collect::<Vec<_>>())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use lava_testdef::TestSource;
  use serde_json::json;

  use super::*;

  fn testdef(document: Value) -> TestDefinition {
    TestDefinition::new(0, "smoke", TestSource::Inline, document)
  }

  #[test]
  fn test_create_without_hooks() {
    let registry = HandlerRegistry::with_builtins();
    let plain = testdef(json!({"run": {"steps": ["true"]}}));
    assert!(registry.create(&plain).unwrap().is_none());
  }

  #[test]
  fn test_unknown_handler() {
    let registry = HandlerRegistry::with_builtins();
    let def = testdef(json!({"run": {"steps": []}, "hooks": {"handler-name": "nope"}}));
    assert!(matches!(
      registry.create(&def),
      Err(SignalError::UnknownHandler(name)) if name == "nope"
    ));
    assert_eq!(
      registry.validate(std::slice::from_ref(&def)),
      vec!["Test definition smoke uses unknown signal handler 'nope'".to_string()]
    );
    assert!(registry.handlers_for(&[def]).is_empty());
  }

  #[test]
  fn test_shell_hooks_registered() {
    let registry = HandlerRegistry::with_builtins();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["shell-hooks"]);
    let def = testdef(json!({
      "run": {"steps": []},
      "hooks": {"handler-name": "shell-hooks", "params": {"start_testrun": "true"}}
    }));
    let handlers = registry.handlers_for(&[def]);
    assert!(handlers.contains_key("0_smoke"));
  }
}
