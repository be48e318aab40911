use std::collections::BTreeMap;
use std::time::Duration;

use lava_connection::{Connection, Pattern};
use lava_pipeline::{Context, LavaError, TimeoutBudget};
use lava_testdef::{ACK_FIFO, PatternFixup};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::director::{DirectorState, SignalDirector, SignalOutcome};

/// Printed by `lava-test-runner` once every test run has finished.
pub const RUNNER_EXITING: &str = "<LAVA_TEST_RUNNER>: exiting";

/// Generic in-band signal marker: name, then space separated parameters.
pub const SIGNAL_MARKER: &str = r"<LAVA_SIGNAL_(\S+) ([^>]+)>";

/// Command that releases the target script blocked on the FIFO.
pub fn ack_command() -> String {
  format!("echo LAVA_ACK > {ACK_FIFO}")
}

/// How the test shell ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
  /// The runner printed its exit marker.
  Completed,
  /// The console closed.
  ConnectionLost,
  /// The overall timeout ran out.
  TimedOut,
}

/// Drives the console while test definitions run on the target: every
/// signal marker is dispatched to the [`SignalDirector`] and acknowledged.
/// Output between STARTRUN and ENDRUN is matched against the run's result
/// pattern.
pub struct TestShellSession {
  director: SignalDirector,
  fixups: BTreeMap<String, PatternFixup>,
  acks: usize,
}

impl TestShellSession {
  pub fn new(director: SignalDirector) -> Self {
    Self {
      director,
      fixups: BTreeMap::new(),
      acks: 0,
    }
  }

  /// Result pattern for a run id.
  pub fn with_fixup(mut self, run_id: impl Into<String>, fixup: PatternFixup) -> Self {
    self.fixups.insert(run_id.into(), fixup);
    self
  }

  pub fn director(&self) -> &SignalDirector {
    &self.director
  }

  /// ACKs written so far.
  pub fn acks(&self) -> usize {
    self.acks
  }

  fn patterns() -> Result<Vec<Pattern>, LavaError> {
    let marker = Pattern::regex(SIGNAL_MARKER)
      .map_err(|e| LavaError::infrastructure(format!("signal marker pattern: {e}")))?;
    Ok(vec![
      Pattern::literal(RUNNER_EXITING),
      Pattern::Eof,
      Pattern::Timeout,
      marker,
    ])
  }

  /// Run until the runner exits or every expected run has ended, the
  /// console closes, or `timeout` is used up.
  ///
  /// Cancellation and console I/O errors are returned as errors.
  #[instrument(skip_all, fields(connection = connection.name(), timeout_secs = timeout.as_secs()))]
  pub async fn run(
    &mut self,
    connection: &mut dyn Connection,
    ctx: &mut Context,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<SessionOutcome, LavaError> {
    let patterns = Self::patterns()?;
    let budget = TimeoutBudget::new(timeout);

    loop {
      let m = connection.expect(&patterns, budget.remaining(), cancel).await?;
      match m.index {
        0 => {
          info!(acks = self.acks, "lava_test_shell completed");
          return Ok(SessionOutcome::Completed);
        }
        1 => {
          warn!(acks = self.acks, "lava_test_shell connection dropped");
          return Ok(SessionOutcome::ConnectionLost);
        }
        2 => {
          warn!(elapsed_secs = budget.elapsed().as_secs(), "lava_test_shell has timed out");
          return Ok(SessionOutcome::TimedOut);
        }
        _ => {
          let name = m.group(1).unwrap_or_default();
          let params: Vec<&str> = m.group(2).unwrap_or_default().split_whitespace().collect();
          match self.director.signal(name, &params, ctx).await {
            SignalOutcome::RunStarted(_) => connection.start_capture(),
            SignalOutcome::RunEnded(run_id) => {
              let output = connection.take_capture();
              self.extract(&run_id, &output, ctx);
              self.director.postprocess_run(&run_id, ctx).await;
            }
            SignalOutcome::Handled | SignalOutcome::Ignored => {}
          }
          connection.send_line(&ack_command()).await?;
          self.acks += 1;
          if self.director.state() == &DirectorState::Done {
            info!(acks = self.acks, "all expected test runs ended");
            return Ok(SessionOutcome::Completed);
          }
        }
      }
    }
  }

  fn extract(&self, run_id: &str, output: &str, ctx: &mut Context) {
    let Some(fixup) = self.fixups.get(run_id) else {
      return;
    };
    let results = fixup.extract(output);
    info!(run_id, count = results.len(), "results parsed from run output");
    for result in results {
      ctx.add_result(result);
    }
  }
}
