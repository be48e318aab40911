use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use lava_pipeline::{ActionRecord, Failure, JobOutcome, JobStatus, SoftwareSource, TestResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const BUNDLE_FORMAT: &str = "Dashboard Bundle Format 1.7";

/// Results of one test definition, or of the dispatcher itself (`lava`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
  pub test_id: String,
  pub analyzer_assigned_uuid: Uuid,
  #[serde(with = "bundle_date")]
  pub analyzer_assigned_date: DateTime<Utc>,
  pub time_check_performed: bool,
  pub test_results: Vec<TestResult>,
  /// Repositories the definition was loaded from.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub software_sources: Vec<SoftwareSource>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub attributes: BTreeMap<String, String>,
}

/// Everything a finished job reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
  pub format: String,
  pub job_id: String,
  pub status: JobStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure: Option<Failure>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub errors: Vec<String>,
  #[serde(default)]
  pub metadata: BTreeMap<String, serde_json::Value>,
  pub duration_ms: u64,
  pub test_runs: Vec<TestRun>,
  #[serde(default)]
  pub actions: Vec<ActionRecord>,
}

impl ResultBundle {
  /// Build the bundle of a finished job. Results are grouped by suite in
  /// the order each suite first reported.
  pub fn from_outcome(outcome: &JobOutcome) -> Self {
    Self::at(outcome, Utc::now().trunc_subsecs(0))
  }

  fn at(outcome: &JobOutcome, now: DateTime<Utc>) -> Self {
    let mut test_runs: Vec<TestRun> = Vec::new();
    for result in outcome.context.results() {
      match test_runs.iter_mut().find(|run| run.test_id == result.suite) {
        Some(run) => run.test_results.push(result.clone()),
        None => test_runs.push(TestRun {
          test_id: result.suite.clone(),
          analyzer_assigned_uuid: Uuid::new_v4(),
          analyzer_assigned_date: now,
          time_check_performed: false,
          test_results: vec![result.clone()],
          software_sources: Vec::new(),
          attributes: BTreeMap::new(),
        }),
      }
    }
    for run in &mut test_runs {
      if let Some(info) = outcome.context.run_info(&run.test_id) {
        run.software_sources = info.software_sources.clone();
        run.attributes = info.attributes.clone();
      }
    }

    Self {
      format: BUNDLE_FORMAT.to_string(),
      job_id: outcome.job_id.clone(),
      status: outcome.status,
      failure: outcome.context.failure().cloned(),
      errors: outcome.errors.clone(),
      metadata: outcome.context.metadata.clone(),
      duration_ms: outcome.duration.as_millis() as u64,
      test_runs,
      actions: outcome.context.action_records().to_vec(),
    }
  }

  pub fn result_count(&self) -> usize {
    self.test_runs.iter().map(|run| run.test_results.len()).sum()
  }
}

/// `2024-01-31T12:00:00Z`, the date format of dashboard bundles.
mod bundle_date {
  use chrono::{DateTime, NaiveDateTime, Utc};
  use serde::{Deserialize, Deserializer, Serializer};

  const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

  pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&date.format(FORMAT).to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&text, FORMAT)
      .map(|naive| naive.and_utc())
      .map_err(serde::de::Error::custom)
  }
}
