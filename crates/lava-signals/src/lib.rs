//! Lava Signals
//!
//! The host side of the test-shell protocol. Scripts on the target print
//! `<LAVA_SIGNAL_{NAME} {params}>` markers and block on `/lava_ack.fifo`
//! until the dispatcher answers with `echo LAVA_ACK > /lava_ack.fifo`.
//!
//! [`TestShellSession`] reads the console, [`SignalDirector`] tracks which
//! test run is active and records results, and [`SignalHandler`]s declared
//! by test definitions get called as runs and test cases start and end.

mod director;
mod error;
mod handler;
mod session;
mod shell_hooks;

pub use director::{DirectorState, SignalDirector, SignalOutcome};
pub use error::SignalError;
pub use handler::{HandlerFactory, HandlerRegistry, SignalHandler};
pub use session::{RUNNER_EXITING, SIGNAL_MARKER, SessionOutcome, TestShellSession, ack_command};
pub use shell_hooks::ShellHooks;
