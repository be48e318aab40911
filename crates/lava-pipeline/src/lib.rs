//! Lava Pipeline
//!
//! The execution engine of the dispatcher. A [`Job`] owns a tree of
//! [`Action`]s arranged in [`Pipeline`]s:
//!
//! 1. Strategies chosen from a [`StrategyRegistry`] build the top-level
//!    actions; each action populates its own child pipeline.
//! 2. [`Pipeline::validate`] collects every error in the tree before
//!    anything touches the device.
//! 3. [`Pipeline::run`] walks the tree depth first. Each action is bounded by
//!    its timeout and by the job's cancellation token; the first error
//!    unwinds the whole tree and is recorded in the [`Context`].
//!
//! Actions never hold references to their parents; the level string
//! (`1.2.3`) is the only link back into the tree.

mod action;
mod context;
mod error;
mod events;
mod job;
mod pipeline;
mod strategy;
mod timeout;

pub use action::{Action, ActionMeta, BuildContext, JobState};
pub use context::{
  ActionRecord, ActionStatus, Context, DataKey, Failure, ResultValue, RunInfo, SoftwareSource,
  TestResult,
};
pub use error::{ErrorKind, LavaError};
pub use events::{ChannelNotifier, JobEvent, JobNotifier, NoopNotifier};
pub use job::{Job, JobOutcome, JobStatus};
pub use pipeline::{ActionDescription, Pipeline};
pub use strategy::{Acceptance, Strategy, StrategyRegistry};
pub use timeout::TimeoutBudget;
