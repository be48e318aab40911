//! Boot strategies and the actions they assemble.

mod login;
mod power;
mod qemu;
mod uboot;

use lava_config::Parameters;
use lava_pipeline::BuildContext;

pub use login::AutoLoginAction;
pub use power::{ConnectDevice, PowerOff, ResetDevice};
pub use qemu::{BootQemuAction, CallQemuAction, QemuStrategy};
pub use uboot::{BootloaderCommands, BootloaderInterrupt, UBootAction, UBootStrategy};

/// A boot block waits for a login prompt when it names prompts, or when
/// a test shell will need the booted system.
fn needs_login(parameters: &Parameters, build: &BuildContext) -> bool {
  parameters.contains_key("prompts") || parameters.contains_key("auto_login") || build.job.has_tests()
}
