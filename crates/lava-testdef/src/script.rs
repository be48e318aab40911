//! Generation of `install.sh` and `run.sh`.

use std::collections::BTreeSet;

use serde_json::Value;

/// FIFO the target blocks on until the dispatcher acknowledges a signal.
pub const ACK_FIFO: &str = "/lava_ack.fifo";

/// Seconds the target waits for an acknowledgement before carrying on.
pub const ACK_TIMEOUT_SECS: u32 = 600;

/// Parts of the install stage a job can ask to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipInstall {
  Keys,
  Sources,
  Deps,
  Steps,
  GitRepos,
  All,
}

impl SkipInstall {
  pub const OPTIONS: [&'static str; 6] = ["keys", "sources", "deps", "steps", "git-repos", "all"];

  pub fn parse(word: &str) -> Option<Self> {
    match word {
      "keys" => Some(SkipInstall::Keys),
      "sources" => Some(SkipInstall::Sources),
      "deps" => Some(SkipInstall::Deps),
      "steps" => Some(SkipInstall::Steps),
      "git-repos" => Some(SkipInstall::GitRepos),
      "all" => Some(SkipInstall::All),
      _ => None,
    }
  }
}

/// The set of skipped install parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipSet(BTreeSet<SkipInstall>);

impl SkipSet {
  pub fn none() -> Self {
    Self::default()
  }

  /// Parse a `skip_install` list; unknown words are returned as errors.
  pub fn from_value(value: Option<&Value>) -> Result<Self, Vec<String>> {
    let Some(value) = value else {
      return Ok(Self::none());
    };
    let Some(words) = value.as_array() else {
      return Err(vec!["skip_install must be a list".to_string()]);
    };
    let mut set = BTreeSet::new();
    let mut errors = Vec::new();
    for word in words {
      match word.as_str().and_then(SkipInstall::parse) {
        Some(option) => {
          set.insert(option);
        }
        None => errors.push(format!(
          "Unrecognised skip_install value: {word} (expected one of {})",
          SkipInstall::OPTIONS.join(", ")
        )),
      }
    }
    if errors.is_empty() {
      Ok(Self(set))
    } else {
      Err(errors)
    }
  }

  pub fn with(mut self, option: SkipInstall) -> Self {
    self.0.insert(option);
    self
  }

  pub fn skips(&self, option: SkipInstall) -> bool {
    self.0.contains(&SkipInstall::All) || self.0.contains(&option)
  }
}

fn string_list(section: Option<&Value>, key: &str) -> Vec<String> {
  section
    .and_then(|s| s.get(key))
    .and_then(Value::as_array)
    .map(|items| items.iter().map(scalar).collect())
    .unwrap_or_default()
}

fn scalar(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn push_line(script: &mut String, line: &str) {
  script.push_str(line);
  script.push('\n');
}

fn shell_quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', r"'\''"))
}

/// `install.sh` for a test definition document.
pub fn install_script(document: &Value, target_dir: &str, skip: &SkipSet) -> String {
  let install = document.get("install");
  let mut script = String::new();
  push_line(&mut script, "set -ex");
  push_line(&mut script, &format!("cd {target_dir}"));

  if !skip.skips(SkipInstall::Keys) {
    for key in string_list(install, "keys") {
      push_line(&mut script, &format!("lava-add-keys {key}"));
    }
  }
  if !skip.skips(SkipInstall::Sources) {
    for source in string_list(install, "sources") {
      push_line(&mut script, &format!("lava-add-sources {source}"));
    }
  }
  if !skip.skips(SkipInstall::Deps) {
    let deps = string_list(install, "deps");
    if !deps.is_empty() {
      push_line(&mut script, &format!("lava-install-packages {}", deps.join(" ")));
    }
  }
  if !skip.skips(SkipInstall::Steps) {
    for step in string_list(install, "steps") {
      push_line(&mut script, &step);
    }
  }
  script
}

/// The exported parameter block at the top of `run.sh`: defaults from the
/// definition (`params` or `parameters`) then the job's own values.
pub fn parameter_lines(document: &Value, job_parameters: Option<&Value>) -> Vec<String> {
  let mut lines = Vec::new();
  let defaults = document
    .get("params")
    .or_else(|| document.get("parameters"))
    .and_then(Value::as_object);
  if let Some(defaults) = defaults {
    lines.push("###default parameters from test definition###\n".to_string());
    for (key, value) in defaults {
      lines.push(format!("{key}={}\n", shell_quote(&scalar(value))));
    }
    lines.push("######\n".to_string());
  }
  if let Some(overrides) = job_parameters.and_then(Value::as_object) {
    lines.push("###test parameters from job submission###\n".to_string());
    for (key, value) in overrides {
      lines.push(format!("{key}={}\n", shell_quote(&scalar(value))));
    }
    lines.push("######\n".to_string());
  }
  lines
}

/// `run.sh`: the definition's run steps wrapped in the STARTRUN/ENDRUN
/// handshake.
pub fn run_script(
  document: &Value,
  run_id: &str,
  name: &str,
  target_dir: &str,
  job_parameters: Option<&Value>,
) -> String {
  let mut script = String::new();
  push_line(&mut script, "set -e");
  push_line(&mut script, &format!("export TESTRUN_ID={run_id}"));
  push_line(&mut script, &format!("export TESTID={name}"));
  for line in parameter_lines(document, job_parameters) {
    script.push_str(&line);
  }
  push_line(&mut script, &format!("[ -p {ACK_FIFO} ] && rm {ACK_FIFO}"));
  push_line(&mut script, &format!("mkfifo {ACK_FIFO}"));
  push_line(&mut script, &format!("cd {target_dir}"));
  push_line(&mut script, &format!("echo \"<LAVA_SIGNAL_STARTRUN {run_id} {name}>\""));
  push_line(&mut script, "#wait up to 10 minutes for an ack from the dispatcher");
  push_line(&mut script, &format!("read -t {ACK_TIMEOUT_SECS} < {ACK_FIFO}"));
  for step in string_list(document.get("run"), "steps") {
    push_line(&mut script, &step);
  }
  push_line(&mut script, &format!("echo \"<LAVA_SIGNAL_ENDRUN {run_id} {name}>\""));
  push_line(&mut script, "#wait up to 10 minutes for an ack from the dispatcher");
  push_line(&mut script, &format!("read -t {ACK_TIMEOUT_SECS} < {ACK_FIFO}"));
  script
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn smoke() -> Value {
    json!({
      "metadata": {"name": "smoke-tests", "format": "Lava-Test Test Definition 1.0"},
      "install": {
        "keys": ["7C751B3F"],
        "sources": ["https://repo.example.com/debian"],
        "deps": ["curl", "lsb-release"],
        "steps": ["./configure"]
      },
      "run": {"steps": ["lava-test-case pwd --shell pwd", "lava-test-case uname --shell uname -a"]}
    })
  }

  #[test]
  fn test_install_script() {
    let script = install_script(&smoke(), "/lava/tests/0_smoke-tests", &SkipSet::none());
    assert_eq!(
      script,
      "set -ex\n\
       cd /lava/tests/0_smoke-tests\n\
       lava-add-keys 7C751B3F\n\
       lava-add-sources https://repo.example.com/debian\n\
       lava-install-packages curl lsb-release\n\
       ./configure\n"
    );
  }

  #[test]
  fn test_skip_deps_only_drops_dependency_block() {
    let full = install_script(&smoke(), "/lava/tests/0_a", &SkipSet::none());
    let skipped = install_script(&smoke(), "/lava/tests/0_a", &SkipSet::none().with(SkipInstall::Deps));

    let removed: Vec<_> = full.lines().filter(|l| !skipped.lines().any(|s| s == *l)).collect();
    assert_eq!(removed, vec!["lava-install-packages curl lsb-release"]);
    assert_eq!(skipped.lines().count(), full.lines().count() - 1);

    let all = install_script(&smoke(), "/lava/tests/0_a", &SkipSet::none().with(SkipInstall::All));
    assert_eq!(all, "set -ex\ncd /lava/tests/0_a\n");
  }

  #[test]
  fn test_skip_list_parsing() {
    let skip = SkipSet::from_value(Some(&json!(["deps"]))).unwrap();
    assert!(skip.skips(SkipInstall::Deps));
    assert!(!skip.skips(SkipInstall::Keys));

    let errors = SkipSet::from_value(Some(&json!(["deps", "tests"]))).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("tests"));
    assert_eq!(SkipInstall::OPTIONS, ["keys", "sources", "deps", "steps", "git-repos", "all"]);
  }

  #[test]
  fn test_run_script_markers() {
    let script = run_script(&smoke(), "0_smoke-tests", "smoke-tests", "/lava/tests/0_smoke-tests", None);
    let lines: Vec<_> = script.lines().collect();
    assert_eq!(lines[0], "set -e");
    assert_eq!(lines[1], "export TESTRUN_ID=0_smoke-tests");
    assert!(lines.contains(&"mkfifo /lava_ack.fifo"));
    assert!(lines.contains(&"echo \"<LAVA_SIGNAL_STARTRUN 0_smoke-tests smoke-tests>\""));
    assert!(lines.contains(&"echo \"<LAVA_SIGNAL_ENDRUN 0_smoke-tests smoke-tests>\""));
    assert_eq!(lines.iter().filter(|l| **l == "read -t 600 < /lava_ack.fifo").count(), 2);

    let start = lines.iter().position(|l| l.contains("STARTRUN")).unwrap();
    let step = lines.iter().position(|l| l.starts_with("lava-test-case pwd")).unwrap();
    let end = lines.iter().position(|l| l.contains("ENDRUN")).unwrap();
    assert!(start < step && step < end);
  }

  #[test]
  fn test_run_script_full_text() {
    let document = json!({"params": {"IFACE": "eth0"}, "run": {"steps": ["ip link show $IFACE"]}});
    let script = run_script(&document, "1_net", "net", "/lava/tests/1_net", None);
    assert_eq!(
      script,
      "set -e\n\
       export TESTRUN_ID=1_net\n\
       export TESTID=net\n\
       ###default parameters from test definition###\n\
       IFACE='eth0'\n\
       ######\n\
       [ -p /lava_ack.fifo ] && rm /lava_ack.fifo\n\
       mkfifo /lava_ack.fifo\n\
       cd /lava/tests/1_net\n\
       echo \"<LAVA_SIGNAL_STARTRUN 1_net net>\"\n\
       #wait up to 10 minutes for an ack from the dispatcher\n\
       read -t 600 < /lava_ack.fifo\n\
       ip link show $IFACE\n\
       echo \"<LAVA_SIGNAL_ENDRUN 1_net net>\"\n\
       #wait up to 10 minutes for an ack from the dispatcher\n\
       read -t 600 < /lava_ack.fifo\n"
    );
  }

  #[test]
  fn test_parameter_blocks() {
    let testdef = json!({"params": {"VARIABLE_NAME_1": "value_1", "VARIABLE_NAME_2": "value_2"}});
    let job = json!({"VARIABLE_NAME_1": "eth2", "VARIABLE_NAME_2": "wlan0"});
    let lines = parameter_lines(&testdef, Some(&job));
    assert_eq!(lines, vec![
      "###default parameters from test definition###\n",
      "VARIABLE_NAME_1='value_1'\n",
      "VARIABLE_NAME_2='value_2'\n",
      "######\n",
      "###test parameters from job submission###\n",
      "VARIABLE_NAME_1='eth2'\n",
      "VARIABLE_NAME_2='wlan0'\n",
      "######\n",
    ]);

    let testdef = json!({"parameters": {"A": "it's"}});
    assert_eq!(parameter_lines(&testdef, None)[1], "A='it'\\''s'\n");
  }
}
