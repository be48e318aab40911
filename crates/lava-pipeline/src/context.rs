//! Per-job shared state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, LavaError};

/// Address of one value in the namespaced data store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataKey {
  pub namespace: String,
  pub action: String,
  pub label: String,
  pub key: String,
}

impl DataKey {
  pub fn new(
    namespace: impl Into<String>,
    action: impl Into<String>,
    label: impl Into<String>,
    key: impl Into<String>,
  ) -> Self {
    Self {
      namespace: namespace.into(),
      action: action.into(),
      label: label.into(),
      key: key.into(),
    }
  }

  /// Key in the `common` namespace.
  pub fn common(action: &str, label: &str, key: &str) -> Self {
    Self::new("common", action, label, key)
  }
}

impl fmt::Display for DataKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}/{}", self.namespace, self.action, self.label, self.key)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataEntry {
  value: serde_json::Value,
  /// Level of the action that wrote the value.
  writer: String,
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultValue {
  Pass,
  Fail,
  Skip,
  Unknown,
}

impl ResultValue {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResultValue::Pass => "pass",
      ResultValue::Fail => "fail",
      ResultValue::Skip => "skip",
      ResultValue::Unknown => "unknown",
    }
  }

  /// Case-insensitive parse of the four canonical words.
  pub fn parse(word: &str) -> Option<Self> {
    match word.to_ascii_lowercase().as_str() {
      "pass" => Some(ResultValue::Pass),
      "fail" => Some(ResultValue::Fail),
      "skip" => Some(ResultValue::Skip),
      "unknown" => Some(ResultValue::Unknown),
      _ => None,
    }
  }
}

impl fmt::Display for ResultValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One test case result. Never modified after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
  /// Run id of the test definition, or `lava` for dispatcher results.
  pub suite: String,
  pub test_case_id: String,
  pub result: ResultValue,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub measurement: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub units: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl TestResult {
  pub fn new(suite: impl Into<String>, test_case_id: impl Into<String>, result: ResultValue) -> Self {
    Self {
      suite: suite.into(),
      test_case_id: test_case_id.into(),
      result,
      measurement: None,
      units: None,
      message: None,
    }
  }

  pub fn with_measurement(mut self, measurement: impl Into<String>, units: Option<String>) -> Self {
    self.measurement = Some(measurement.into());
    self.units = units;
    self
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  Pass,
  Fail,
}

/// Record of one executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
  pub level: String,
  pub name: String,
  pub status: ActionStatus,
  pub duration_ms: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// The action that was running when the job failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
  pub level: String,
  pub name: String,
  pub description: String,
  pub kind: ErrorKind,
  pub error: String,
}

/// A repository a test run was loaded from, at the revision that was
/// actually checked out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareSource {
  pub project_name: String,
  pub branch_vcs: String,
  pub branch_url: String,
  pub branch_revision: String,
}

/// Details reported beside the results of one test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub software_sources: Vec<SoftwareSource>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attributes: BTreeMap<String, String>,
}

/// Mutable state of one job, shared by every action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
  #[serde(skip)]
  data: BTreeMap<DataKey, DataEntry>,
  pub metadata: BTreeMap<String, serde_json::Value>,
  results: Vec<TestResult>,
  #[serde(default)]
  runs: BTreeMap<String, RunInfo>,
  actions: Vec<ActionRecord>,
  failure: Option<Failure>,
}

impl Context {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store a value. A different writer overwriting an existing key is
  /// logged; the new value wins.
  pub fn set(&mut self, key: DataKey, value: serde_json::Value, writer: &str) {
    if let Some(existing) = self.data.get(&key)
      && existing.writer != writer
    {
      warn!(
        key = %key,
        previous_writer = %existing.writer,
        writer = %writer,
        "namespace data overwritten by another action"
      );
    }
    debug!(key = %key, writer = %writer, "namespace data set");
    self.data.insert(
      key,
      DataEntry {
        value,
        writer: writer.to_string(),
      },
    );
  }

  pub fn get(&self, key: &DataKey) -> Option<&serde_json::Value> {
    self.data.get(key).map(|entry| &entry.value)
  }

  pub fn get_str(&self, key: &DataKey) -> Option<&str> {
    self.get(key).and_then(|v| v.as_str())
  }

  /// Like [`get_str`](Self::get_str) but a missing value is an
  /// infrastructure error naming the key.
  pub fn require_str(&self, key: &DataKey) -> Result<&str, LavaError> {
    self
      .get_str(key)
      .ok_or_else(|| LavaError::infrastructure(format!("missing namespace data {key}")))
  }

  pub fn add_result(&mut self, result: TestResult) {
    self.results.push(result);
  }

  pub fn results(&self) -> &[TestResult] {
    &self.results
  }

  /// Results recorded for one test run, in order.
  pub fn results_for<'a>(&'a self, run_id: &'a str) -> impl Iterator<Item = &'a TestResult> + 'a {
    self.results.iter().filter(move |r| r.suite == run_id)
  }

  pub fn run_info(&self, run_id: &str) -> Option<&RunInfo> {
    self.runs.get(run_id)
  }

  pub fn run_info_mut(&mut self, run_id: &str) -> &mut RunInfo {
    self.runs.entry(run_id.to_string()).or_default()
  }

  pub(crate) fn record_action(&mut self, record: ActionRecord) {
    self.actions.push(record);
  }

  pub fn action_records(&self) -> &[ActionRecord] {
    &self.actions
  }

  /// Record the failing action. The first call wins, which is the innermost
  /// action since errors are recorded while unwinding.
  pub(crate) fn record_failure(&mut self, failure: Failure) {
    if self.failure.is_none() {
      self.failure = Some(failure);
    }
  }

  pub fn failure(&self) -> Option<&Failure> {
    self.failure.as_ref()
  }

  pub fn has_failed_tests(&self) -> bool {
    self.results.iter().any(|r| r.result == ResultValue::Fail)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_namespace_data() {
    let mut ctx = Context::new();
    let key = DataKey::common("download-action", "rootfs", "file");
    ctx.set(key.clone(), json!("/tmp/rootfs.img"), "1.1");
    assert_eq!(ctx.get_str(&key), Some("/tmp/rootfs.img"));

    ctx.set(key.clone(), json!("/tmp/other.img"), "2.1");
    assert_eq!(ctx.get_str(&key), Some("/tmp/other.img"));

    let missing = DataKey::common("download-action", "kernel", "file");
    assert!(ctx.require_str(&missing).is_err());
  }

  #[test]
  fn test_first_failure_is_kept() {
    let mut ctx = Context::new();
    for (level, name) in [("1.2", "inner"), ("1", "outer")] {
      ctx.record_failure(Failure {
        level: level.to_string(),
        name: name.to_string(),
        description: String::new(),
        kind: ErrorKind::Infrastructure,
        error: "boom".to_string(),
      });
    }
    assert_eq!(ctx.failure().unwrap().name, "inner");
  }

  #[test]
  fn test_run_info_is_per_run() {
    let mut ctx = Context::new();
    ctx.add_result(TestResult::new("0_smoke", "boot", ResultValue::Pass));
    ctx.add_result(TestResult::new("1_net", "ping", ResultValue::Fail));
    ctx.run_info_mut("0_smoke").software_sources.push(SoftwareSource {
      project_name: "0_smoke".to_string(),
      branch_vcs: "git".to_string(),
      branch_url: "https://example.com/tests.git".to_string(),
      branch_revision: "abc123".to_string(),
    });

    assert_eq!(ctx.run_info("0_smoke").unwrap().software_sources.len(), 1);
    assert!(ctx.run_info("1_net").is_none());
    let ids: Vec<_> = ctx.results_for("1_net").map(|r| r.test_case_id.as_str()).collect();
    assert_eq!(ids, vec!["ping"]);
  }

  #[test]
  fn test_result_words() {
    assert_eq!(ResultValue::parse("PASS"), Some(ResultValue::Pass));
    assert_eq!(ResultValue::parse("Skip"), Some(ResultValue::Skip));
    assert_eq!(ResultValue::parse("broken"), None);
  }
}
