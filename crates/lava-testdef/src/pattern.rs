//! Extraction of test case results from captured output.

use std::collections::BTreeMap;

use lava_pipeline::{ResultValue, TestResult};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::definition::TestDefinition;

/// Pattern used when a definition declares none.
pub const DEFAULT_PATTERN: &str =
  r"(?P<test_case_id>.*-*)\s+:\s+(?P<result>(?i:pass|fail|skip|unknown))";

/// A definition's result pattern plus its `fixupdict`, which maps the
/// test's own result words onto pass/fail/skip/unknown.
#[derive(Debug, Clone)]
pub struct PatternFixup {
  suite: Option<String>,
  pattern: String,
  regex: Result<Regex, String>,
  fixupdict: BTreeMap<String, String>,
}

impl PatternFixup {
  /// Pattern for a definition; without one the fixup is invalid since
  /// results could not be attributed to a suite.
  pub fn new(testdef: Option<&TestDefinition>) -> Self {
    let parse = testdef.and_then(|t| t.parse_block());
    let pattern = match parse.and_then(|p| p.get("pattern")) {
      Some(Value::String(pattern)) => pattern.clone(),
      Some(_) => String::new(),
      None => DEFAULT_PATTERN.to_string(),
    };
    let fixupdict = parse
      .and_then(|p| p.get("fixupdict"))
      .and_then(Value::as_object)
      .map(|map| {
        map
          .iter()
          .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
          .collect()
      })
      .unwrap_or_default();
    Self::build(testdef.map(|t| t.run_id.clone()), pattern, fixupdict)
  }

  /// Pattern from explicit values.
  pub fn with_pattern(
    suite: impl Into<String>,
    pattern: &str,
    fixupdict: BTreeMap<String, String>,
  ) -> Self {
    Self::build(Some(suite.into()), pattern.to_string(), fixupdict)
  }

  fn build(suite: Option<String>, pattern: String, fixupdict: BTreeMap<String, String>) -> Self {
    let regex = if pattern.trim().is_empty() {
      Err("empty parse pattern".to_string())
    } else {
      Regex::new(&pattern).map_err(|e| e.to_string())
    };
    Self {
      suite,
      pattern,
      regex,
      fixupdict,
    }
  }

  pub fn pattern(&self) -> &str {
    &self.pattern
  }

  pub fn valid(&self) -> bool {
    self.errors().is_empty()
  }

  pub fn errors(&self) -> Vec<String> {
    let mut errors = Vec::new();
    let suite = self.suite.as_deref().unwrap_or("<unnamed>");
    if self.suite.is_none() {
      errors.push("Result pattern has no test definition name".to_string());
    }
    match &self.regex {
      Err(message) => errors.push(format!("Invalid parse pattern for {suite}: {message}")),
      Ok(regex) => {
        let names: Vec<_> = regex.capture_names().flatten().collect();
        for required in ["test_case_id", "result"] {
          if !names.contains(&required) {
            errors.push(format!(
              "Parse pattern for {suite} has no '{required}' group"
            ));
          }
        }
      }
    }
    errors
  }

  /// Results found in `output`, one per matching line, in order.
  /// Lines that do not match, or whose result word is not recognized,
  /// are skipped.
  pub fn extract(&self, output: &str) -> Vec<TestResult> {
    let (Ok(regex), Some(suite)) = (&self.regex, &self.suite) else {
      return Vec::new();
    };
    let mut results = Vec::new();
    for line in output.lines() {
      let line = line.trim_end_matches('\r');
      let Some(caps) = regex.captures(line) else {
        continue;
      };
      let (Some(id), Some(word)) = (caps.name("test_case_id"), caps.name("result")) else {
        continue;
      };
      let word = word.as_str().trim();
      let mapped = self.fixupdict.get(word).map(String::as_str).unwrap_or(word);
      let Some(result) = ResultValue::parse(mapped) else {
        warn!(suite = %suite, line = %line, result = %mapped, "unrecognized result word");
        continue;
      };
      let test_case_id = id
        .as_str()
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
      if test_case_id.is_empty() {
        continue;
      }

      let mut entry = TestResult::new(suite.clone(), test_case_id, result);
      if let Some(measurement) = caps.name("measurement").map(|m| m.as_str().trim())
        && !measurement.is_empty()
      {
        let units = caps.name("units").map(|u| u.as_str().trim().to_string());
        entry = entry.with_measurement(measurement, units.filter(|u| !u.is_empty()));
      }
      debug!(suite = %suite, test_case_id = %entry.test_case_id, result = %entry.result, "result extracted");
      results.push(entry);
    }
    results
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::definition::TestSource;

  fn testdef(parse: Value) -> TestDefinition {
    TestDefinition::new(
      0,
      "params",
      TestSource::Inline,
      json!({"metadata": {"name": "params"}, "run": {"steps": []}, "parse": parse}),
    )
  }

  #[test]
  fn test_declared_pattern() {
    let def = testdef(json!({"pattern": r"(?P<test_case_id>.*-*):\s+(?P<result>(pass|fail))"}));
    let fixup = PatternFixup::new(Some(&def));
    assert!(fixup.valid());
    let results = fixup.extract("test1a: pass");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].test_case_id, "test1a");
    assert_eq!(results[0].result, ResultValue::Pass);
    assert_eq!(results[0].suite, "0_params");
  }

  #[test]
  fn test_without_definition_is_invalid() {
    assert!(!PatternFixup::new(None).valid());
  }

  #[test]
  fn test_default_pattern_is_case_insensitive() {
    let fixup = PatternFixup::with_pattern("0_x", DEFAULT_PATTERN, BTreeMap::new());
    let output = "boot noise\nlinpack : PASS\nmemtest : Fail\nskipped one : skip\nnot a result\n";
    let results = fixup.extract(output);
    let pairs: Vec<_> = results
      .iter()
      .map(|r| (r.test_case_id.as_str(), r.result))
      .collect();
    assert_eq!(pairs, vec![
      ("linpack", ResultValue::Pass),
      ("memtest", ResultValue::Fail),
      ("skipped_one", ResultValue::Skip),
    ]);
  }

  #[test]
  fn test_fixupdict_and_measurement() {
    let mut fixups = BTreeMap::new();
    fixups.insert("OK".to_string(), "pass".to_string());
    fixups.insert("BROKEN".to_string(), "fail".to_string());
    let fixup = PatternFixup::with_pattern(
      "1_bench",
      r"^(?P<test_case_id>\S+) (?P<result>\w+)(?: (?P<measurement>[\d.]+) (?P<units>\w+))?$",
      fixups,
    );
    let results = fixup.extract("dhrystone OK 1234.5 DMIPS\nwhetstone BROKEN\nfoo WHAT\n");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].measurement.as_deref(), Some("1234.5"));
    assert_eq!(results[0].units.as_deref(), Some("DMIPS"));
    assert_eq!(results[1].result, ResultValue::Fail);
    assert!(results[1].measurement.is_none());
  }

  #[test]
  fn test_empty_pattern_is_error() {
    let def = testdef(json!({"pattern": ""}));
    let errors = PatternFixup::new(Some(&def)).errors();
    assert_eq!(errors, vec!["Invalid parse pattern for 0_params: empty parse pattern".to_string()]);

    let def = testdef(json!({"pattern": r"(?P<id>\w+)"}));
    assert_eq!(PatternFixup::new(Some(&def)).errors().len(), 2);
  }

  #[test]
  fn test_extraction_is_repeatable() {
    let fixup = PatternFixup::with_pattern("0_x", DEFAULT_PATTERN, BTreeMap::new());
    let output = "a : pass\nb : fail\n";
    assert_eq!(fixup.extract(output), fixup.extract(output));
  }
}
