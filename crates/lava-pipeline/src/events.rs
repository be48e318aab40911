//! Job events and notifiers.
//!
//! Events are emitted while a job runs so a caller can stream progress,
//! persist it or ignore it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::TestResult;
use crate::job::JobStatus;

/// Events emitted during job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
  JobStarted {
    job_id: String,
    job_name: String,
  },

  ActionStarted {
    job_id: String,
    level: String,
    name: String,
  },

  ActionCompleted {
    job_id: String,
    level: String,
    name: String,
    duration_ms: u64,
  },

  ActionFailed {
    job_id: String,
    level: String,
    name: String,
    error: String,
  },

  /// A test case result was recorded.
  TestResult { job_id: String, result: TestResult },

  JobFinished { job_id: String, status: JobStatus },
}

/// Receives job events.
pub trait JobNotifier: Send + Sync {
  fn notify(&self, event: JobEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl JobNotifier for NoopNotifier {
  fn notify(&self, _event: JobEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a wait on the device.
  sender: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<JobEvent>) -> Self {
    Self { sender }
  }
}

impl JobNotifier for ChannelNotifier {
  fn notify(&self, event: JobEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
