use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timeout::TimeoutSpec;

/// How to reach the device console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
  /// Shell command whose stdio is the console, e.g. `telnet localhost 7001`
  /// or `conmux-console beaglebone01`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub command: Option<String>,
  #[serde(default = "default_line_separator")]
  pub line_separator: String,
  /// Delay between characters sent to slow serial lines.
  #[serde(default)]
  pub character_delay_ms: u64,
}

fn default_line_separator() -> String {
  "\n".to_string()
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    Self {
      command: None,
      line_separator: default_line_separator(),
      character_delay_ms: 0,
    }
  }
}

/// Host-side commands controlling device power.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommands {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub power_on: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub power_off: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hard_reset: Option<String>,
}

/// The methods a device supports for one section, each with its own
/// free-form configuration block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSet {
  #[serde(default)]
  pub methods: BTreeMap<String, serde_json::Value>,
}

impl MethodSet {
  pub fn contains(&self, method: &str) -> bool {
    self.methods.contains_key(method)
  }

  pub fn get(&self, method: &str) -> Option<&serde_json::Value> {
    self.methods.get(method)
  }

  /// The `parameters` mapping of a method, if it has one.
  pub fn parameters(&self, method: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
    self
      .methods
      .get(method)
      .and_then(|m| m.get("parameters"))
      .and_then(|p| p.as_object())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceActions {
  #[serde(default)]
  pub deploy: MethodSet,
  #[serde(default)]
  pub boot: MethodSet,
}

/// A device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
  pub hostname: String,
  pub device_type: String,
  #[serde(default)]
  pub connection: ConnectionConfig,
  #[serde(default)]
  pub commands: DeviceCommands,
  #[serde(default)]
  pub actions: DeviceActions,
  /// Per-action timeout overrides keyed by action name.
  #[serde(default)]
  pub timeouts: BTreeMap<String, TimeoutSpec>,
}

impl DeviceConfig {
  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::parse("device configuration", e))
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_yaml(&content)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DEVICE: &str = r#"
hostname: bbb01
device_type: beaglebone-black
connection:
  command: telnet localhost 7001
  character_delay_ms: 5
commands:
  hard_reset: /usr/bin/pduclient --port 3 --command reboot
actions:
  deploy:
    methods:
      nfs: {}
      tftp: {}
  boot:
    methods:
      u-boot:
        parameters:
          bootloader_prompt: "=>"
        nfs:
          commands: ["setenv autoload no", "boot"]
"#;

  #[test]
  fn test_parse_device() {
    let device = DeviceConfig::from_yaml(DEVICE).expect("device should parse");
    assert_eq!(device.hostname, "bbb01");
    assert_eq!(device.connection.line_separator, "\n");
    assert_eq!(device.connection.character_delay_ms, 5);
    assert!(device.actions.deploy.contains("nfs"));
    assert!(!device.actions.deploy.contains("image"));
    let params = device.actions.boot.parameters("u-boot").unwrap();
    assert_eq!(params["bootloader_prompt"], "=>");
    assert!(device.commands.power_off.is_none());
  }
}
