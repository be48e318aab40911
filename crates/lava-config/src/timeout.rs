use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A timeout as written in job and device files: `{minutes: 5}`,
/// `{seconds: 90}` or any combination of the four units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSpec {
  #[serde(default, skip_serializing_if = "is_zero")]
  pub days: u64,
  #[serde(default, skip_serializing_if = "is_zero")]
  pub hours: u64,
  #[serde(default, skip_serializing_if = "is_zero")]
  pub minutes: u64,
  #[serde(default, skip_serializing_if = "is_zero")]
  pub seconds: u64,
}

fn is_zero(value: &u64) -> bool {
  *value == 0
}

impl TimeoutSpec {
  pub const fn seconds(seconds: u64) -> Self {
    Self {
      days: 0,
      hours: 0,
      minutes: 0,
      seconds,
    }
  }

  pub const fn minutes(minutes: u64) -> Self {
    Self {
      days: 0,
      hours: 0,
      minutes,
      seconds: 0,
    }
  }

  pub fn as_duration(&self) -> Duration {
    Duration::from_secs(
      self.days * 86_400 + self.hours * 3_600 + self.minutes * 60 + self.seconds,
    )
  }

  /// Read a timeout out of a dynamic parameter value.
  ///
  /// Accepts the mapping form and a bare integer number of seconds, which is
  /// what older job files use.
  pub fn from_value(value: &serde_json::Value) -> Option<Self> {
    match value {
      serde_json::Value::Number(n) => n.as_u64().map(Self::seconds),
      serde_json::Value::Object(_) => serde_json::from_value(value.clone()).ok(),
      _ => None,
    }
  }
}

impl From<TimeoutSpec> for Duration {
  fn from(spec: TimeoutSpec) -> Self {
    spec.as_duration()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_units_add_up() {
    let spec = TimeoutSpec {
      days: 0,
      hours: 1,
      minutes: 2,
      seconds: 3,
    };
    assert_eq!(spec.as_duration(), Duration::from_secs(3723));
  }

  #[test]
  fn test_from_value_accepts_integer_and_mapping() {
    assert_eq!(
      TimeoutSpec::from_value(&json!(600)),
      Some(TimeoutSpec::seconds(600))
    );
    assert_eq!(
      TimeoutSpec::from_value(&json!({"minutes": 5})),
      Some(TimeoutSpec::minutes(5))
    );
    assert_eq!(TimeoutSpec::from_value(&json!("soon")), None);
  }
}
