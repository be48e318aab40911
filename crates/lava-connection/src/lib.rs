//! Lava Connection
//!
//! Everything the dispatcher says to, or hears from, a device goes through
//! the [`Connection`] trait: send a line, send a control character, and wait
//! for one of several [`Pattern`]s with a timeout. Keeping the surface this
//! narrow lets every device-facing action run against an in-memory stream in
//! tests.
//!
//! [`Console`] implements the trait over any pair of async byte streams, most
//! commonly the stdio of a spawned console command (`telnet`,
//! `conmux-console`, `ssh`, `qemu -nographic`).

mod console;
mod error;
mod pattern;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use console::Console;
pub use error::ConnectionError;
pub use pattern::{ExpectMatch, Pattern};

/// A bidirectional, line-oriented connection to a device console.
///
/// Not safe for concurrent use; all methods take `&mut self` so only one
/// command sequence can be in flight.
#[async_trait]
pub trait Connection: Send {
  /// Human readable name used in logs.
  fn name(&self) -> &str;

  /// Write raw text without a terminator.
  async fn send(&mut self, text: &str) -> Result<(), ConnectionError>;

  /// Write text followed by the line separator.
  async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError>;

  /// Write a control character, `send_control('c')` sends `^C`.
  async fn send_control(&mut self, c: char) -> Result<(), ConnectionError>;

  /// Wait until one of `patterns` matches incoming data.
  ///
  /// The earliest match in the stream wins, ties go to the lowest index.
  /// [`Pattern::Eof`] and [`Pattern::Timeout`] turn those conditions into a
  /// regular match; without them they are returned as errors. Cancelling
  /// `cancel` interrupts the wait.
  async fn expect(
    &mut self,
    patterns: &[Pattern],
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<ExpectMatch, ConnectionError>;

  /// Start recording everything consumed by `expect`.
  fn start_capture(&mut self);

  /// Stop recording and return the transcript since `start_capture`.
  fn take_capture(&mut self) -> String;

  /// Close the connection, terminating the console process if there is one.
  async fn close(&mut self) -> Result<(), ConnectionError>;
}
