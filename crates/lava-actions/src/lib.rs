//! Lava Actions
//!
//! The concrete actions a job is made of and the strategies that choose
//! them:
//!
//! - deploy: `nfs` (download, unpack and overlay an NFS root) and `images`
//!   (download images for an emulated device)
//! - boot: `qemu` and `u-boot`, both ending in an optional auto-login
//! - test: `lava-test-shell`, which drives the signal protocol
//! - `finalize`, always last
//!
//! [`JobParser`] assembles them into a [`lava_pipeline::Job`].

pub mod boot;
mod command;
pub mod deploy;
mod finalize;
pub mod keys;
mod parser;
mod template;
mod test_shell;
pub mod testdef;

use lava_pipeline::StrategyRegistry;

pub use finalize::FinalizeAction;
pub use parser::JobParser;
pub use test_shell::{TESTDEF_OFFSET, TestShellAction, TestShellStrategy};

/// Every strategy shipped with the dispatcher, in selection order.
pub fn builtin_strategies() -> StrategyRegistry {
  StrategyRegistry::new()
    .with(deploy::NfsStrategy)
    .with(deploy::ImagesStrategy)
    .with(boot::QemuStrategy)
    .with(boot::UBootStrategy)
    .with(TestShellStrategy)
}
