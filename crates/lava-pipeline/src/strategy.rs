//! Strategy selection: which concrete action subtree implements a section
//! of the job on a given device.

use lava_config::{DeviceConfig, Parameters, Section};
use tracing::debug;

use crate::action::Action;
use crate::error::LavaError;

/// Answer of [`Strategy::accepts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
  pub accepted: bool,
  pub reason: String,
}

impl Acceptance {
  pub fn accept() -> Self {
    Self {
      accepted: true,
      reason: "accepted".to_string(),
    }
  }

  pub fn reject(reason: impl Into<String>) -> Self {
    Self {
      accepted: false,
      reason: reason.into(),
    }
  }
}

/// One way of implementing a job section.
pub trait Strategy: Send + Sync {
  /// Short name, e.g. `nfs` or `u-boot`.
  fn name(&self) -> &'static str;

  fn section(&self) -> Section;

  /// Higher wins when several strategies accept.
  fn compatibility(&self) -> u32 {
    1
  }

  /// Tie-break between equally compatible strategies; higher first.
  fn priority(&self) -> i32 {
    0
  }

  fn accepts(&self, device: &DeviceConfig, parameters: &Parameters) -> Acceptance;

  /// Build the (unpopulated) top-level action.
  fn action(&self, parameters: &Parameters) -> Box<dyn Action>;
}

/// The set of strategies known to the dispatcher, in registration order.
#[derive(Default)]
pub struct StrategyRegistry {
  strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, strategy: Box<dyn Strategy>) {
    self.strategies.push(strategy);
  }

  pub fn with(mut self, strategy: impl Strategy + 'static) -> Self {
    self.register(Box::new(strategy));
    self
  }

  pub fn strategies(&self, section: Section) -> impl Iterator<Item = &dyn Strategy> {
    self
      .strategies
      .iter()
      .filter(move |s| s.section() == section)
      .map(|s| s.as_ref())
  }

  /// Pick the strategy for `section`.
  ///
  /// Among the strategies that accept, the highest compatibility wins, then
  /// the highest priority, then the earliest registered. When none accepts,
  /// the validation error lists every rejection reason.
  pub fn select(
    &self,
    section: Section,
    device: &DeviceConfig,
    parameters: &Parameters,
  ) -> Result<&dyn Strategy, LavaError> {
    let mut rejections = Vec::new();
    let mut best: Option<&dyn Strategy> = None;

    for strategy in self.strategies(section) {
      let answer = strategy.accepts(device, parameters);
      debug!(
        section = %section,
        strategy = strategy.name(),
        accepted = answer.accepted,
        reason = %answer.reason,
        "strategy vote"
      );
      if !answer.accepted {
        rejections.push(format!("{}: {}", strategy.name(), answer.reason));
        continue;
      }
      let better = match best {
        None => true,
        Some(current) => {
          (strategy.compatibility(), strategy.priority())
            > (current.compatibility(), current.priority())
        }
      };
      if better {
        best = Some(strategy);
      }
    }

    match best {
      Some(strategy) => Ok(strategy),
      None => {
        let mut errors = vec![format!(
          "No strategy accepts these parameters for this device ({section})"
        )];
        errors.extend(rejections);
        Err(LavaError::validation(errors))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::ActionMeta;

  struct Fixed {
    name: &'static str,
    compatibility: u32,
    priority: i32,
    accept: bool,
  }

  struct Dummy(ActionMeta);

  #[async_trait::async_trait]
  impl Action for Dummy {
    fn meta(&self) -> &ActionMeta {
      &self.0
    }

    fn meta_mut(&mut self) -> &mut ActionMeta {
      &mut self.0
    }
  }

  impl Strategy for Fixed {
    fn name(&self) -> &'static str {
      self.name
    }

    fn section(&self) -> Section {
      Section::Deploy
    }

    fn compatibility(&self) -> u32 {
      self.compatibility
    }

    fn priority(&self) -> i32 {
      self.priority
    }

    fn accepts(&self, _device: &DeviceConfig, _parameters: &Parameters) -> Acceptance {
      if self.accept {
        Acceptance::accept()
      } else {
        Acceptance::reject(format!("{} says no", self.name))
      }
    }

    fn action(&self, _parameters: &Parameters) -> Box<dyn Action> {
      Box::new(Dummy(ActionMeta::new(self.name, "", "")))
    }
  }

  fn fixed(name: &'static str, compatibility: u32, priority: i32, accept: bool) -> Fixed {
    Fixed {
      name,
      compatibility,
      priority,
      accept,
    }
  }

  fn device() -> DeviceConfig {
    DeviceConfig::from_yaml("hostname: d\ndevice_type: t\n").unwrap()
  }

  #[test]
  fn test_highest_compatibility_then_priority_then_order() {
    let registry = StrategyRegistry::new()
      .with(fixed("low", 1, 9, true))
      .with(fixed("first", 3, 0, true))
      .with(fixed("second", 3, 0, true))
      .with(fixed("rejecting", 9, 9, false));
    let chosen = registry
      .select(Section::Deploy, &device(), &Parameters::new())
      .unwrap();
    assert_eq!(chosen.name(), "first");

    let registry = StrategyRegistry::new()
      .with(fixed("first", 3, 0, true))
      .with(fixed("preferred", 3, 5, true));
    let chosen = registry
      .select(Section::Deploy, &device(), &Parameters::new())
      .unwrap();
    assert_eq!(chosen.name(), "preferred");
  }

  #[test]
  fn test_no_acceptance_is_validation_error() {
    let registry = StrategyRegistry::new().with(fixed("nfs", 1, 0, false));
    let err = registry
      .select(Section::Deploy, &device(), &Parameters::new())
      .err()
      .unwrap();
    let LavaError::Validation { errors } = err else {
      panic!("expected a validation error");
    };
    assert_eq!(
      errors[0],
      "No strategy accepts these parameters for this device (deploy)"
    );
    assert_eq!(errors[1], "nfs: nfs says no");

    let empty = StrategyRegistry::new();
    assert!(empty.select(Section::Boot, &device(), &Parameters::new()).is_err());
  }

  #[test]
  fn test_selection_is_deterministic() {
    let registry = StrategyRegistry::new()
      .with(fixed("a", 2, 1, true))
      .with(fixed("b", 2, 1, true));
    let picks: Vec<_> = (0..5)
      .map(|_| registry.select(Section::Deploy, &device(), &Parameters::new()).unwrap().name())
      .collect();
    assert!(picks.iter().all(|name| *name == "a"));
  }
}
