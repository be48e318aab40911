use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timeout::TimeoutSpec;

/// Free-form action parameters, as submitted.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// The pipeline section an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
  Deploy,
  Boot,
  Test,
  Finalize,
}

impl Section {
  pub fn as_str(&self) -> &'static str {
    match self {
      Section::Deploy => "deploy",
      Section::Boot => "boot",
      Section::Test => "test",
      Section::Finalize => "finalize",
    }
  }
}

impl fmt::Display for Section {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Section {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "deploy" => Ok(Section::Deploy),
      "boot" => Ok(Section::Boot),
      "test" | "lava_test_shell" => Ok(Section::Test),
      "finalize" => Ok(Section::Finalize),
      other => Err(ConfigError::Invalid(format!("unknown action command '{other}'"))),
    }
  }
}

/// One entry of the job's `actions` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
  pub command: String,
  #[serde(default)]
  pub parameters: Parameters,
  #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
  pub metadata: Parameters,
}

impl ActionSpec {
  pub fn section(&self) -> Result<Section, ConfigError> {
    self.command.parse()
  }
}

/// Job-level timeouts. Per-action overrides are keyed by action name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimeouts {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub job: Option<TimeoutSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub action: Option<TimeoutSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub connection: Option<TimeoutSpec>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub actions: BTreeMap<String, TimeoutSpec>,
}

/// A submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
  pub job_name: String,
  /// Hostname of the device this job was written for, informational only.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<String>,
  #[serde(default)]
  pub timeouts: JobTimeouts,
  #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
  pub metadata: Parameters,
  pub actions: Vec<ActionSpec>,
}

impl JobDefinition {
  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::parse("job definition", e))
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_yaml(&content)
  }

  /// Action specs belonging to the given section, in submission order.
  pub fn blocks(&self, section: Section) -> impl Iterator<Item = &ActionSpec> {
    self
      .actions
      .iter()
      .filter(move |spec| spec.section().ok() == Some(section))
  }

  pub fn has_tests(&self) -> bool {
    self.blocks(Section::Test).next().is_some()
  }

  /// The `definitions` of every test block, flattened in submission order.
  pub fn test_definitions(&self) -> Vec<&serde_json::Value> {
    self
      .blocks(Section::Test)
      .filter_map(|spec| spec.parameters.get("definitions"))
      .filter_map(|defs| defs.as_array())
      .flatten()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const JOB: &str = r#"
job_name: kvm-test
timeouts:
  job: {minutes: 30}
  actions:
    lava-test-shell: {minutes: 10}
actions:
  - command: deploy
    parameters:
      to: tmpfs
      images:
        rootfs: {url: "file:///tmp/rootfs.img"}
  - command: boot
    parameters: {method: qemu}
  - command: test
    parameters:
      definitions:
        - {from: git, repository: "https://example.com/tests.git", path: smoke.yaml, name: smoke-tests}
        - {from: inline, name: inline-test, path: inline/x.yaml}
"#;

  #[test]
  fn test_parse_job() {
    let job = JobDefinition::from_yaml(JOB).expect("job should parse");
    assert_eq!(job.job_name, "kvm-test");
    assert_eq!(job.actions.len(), 3);
    assert_eq!(job.timeouts.job, Some(TimeoutSpec::minutes(30)));
    assert!(job.has_tests());
    assert_eq!(job.test_definitions().len(), 2);
    assert_eq!(job.blocks(Section::Boot).count(), 1);
  }

  #[test]
  fn test_json_job_parses() {
    let json = r#"{"job_name": "j", "actions": [{"command": "deploy", "parameters": {"to": "nfs"}}]}"#;
    let job = JobDefinition::from_yaml(json).expect("json is valid yaml");
    assert!(!job.has_tests());
    assert_eq!(job.actions[0].section().unwrap(), Section::Deploy);
  }

  #[test]
  fn test_unknown_command() {
    let spec = ActionSpec {
      command: "flash".to_string(),
      parameters: Parameters::new(),
      metadata: Parameters::new(),
    };
    assert!(spec.section().is_err());
  }
}
