use std::time::Duration;

use tokio::time::Instant;

/// A fixed deadline shared by a sequence of waits.
///
/// Each wait asks for [`remaining`](Self::remaining), so retried waits can
/// never add up to more than the total. Once the deadline has passed the
/// remainder is zero: a wait still polls data that is already buffered and
/// then times out.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
  total: Duration,
  started: Instant,
}

impl TimeoutBudget {
  pub fn new(total: Duration) -> Self {
    Self {
      total,
      started: Instant::now(),
    }
  }

  pub fn total(&self) -> Duration {
    self.total
  }

  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }

  pub fn remaining(&self) -> Duration {
    self.total.saturating_sub(self.elapsed())
  }

  pub fn is_exhausted(&self) -> bool {
    self.remaining().is_zero()
  }

  /// The instant the budget runs out.
  pub fn deadline(&self) -> Instant {
    self.started + self.total
  }

  /// The smaller of `limit` and what is left.
  pub fn cap(&self, limit: Duration) -> Duration {
    limit.min(self.remaining())
  }
}
