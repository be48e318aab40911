//! Lava Config
//!
//! Serializable configuration consumed by the dispatcher:
//!
//! - [`JobDefinition`]: the submitted job, an ordered list of action specs
//!   (`command` + `parameters` + `metadata`).
//! - [`DeviceConfig`]: the device under test, its console connection, power
//!   commands and the deploy/boot methods it supports.
//! - [`DispatcherConfig`]: host-side settings (scratch space, default timeouts).
//! - [`DeploymentData`]: per-OS profile of on-target paths and shell, picked
//!   when the pipeline is built and passed by value.
//!
//! Job and device files are YAML; JSON documents parse as well since the
//! parser accepts the JSON subset of YAML.

mod deployment;
mod device;
mod dispatcher;
mod error;
mod job;
mod timeout;

pub use deployment::{DeploymentData, StartupStyle};
pub use device::{ConnectionConfig, DeviceActions, DeviceCommands, DeviceConfig, MethodSet};
pub use dispatcher::DispatcherConfig;
pub use error::ConfigError;
pub use job::{ActionSpec, JobDefinition, JobTimeouts, Parameters, Section};
pub use timeout::TimeoutSpec;
