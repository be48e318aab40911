//! Opening the console and controlling power.

use std::time::Duration;

use async_trait::async_trait;
use lava_connection::{Console, Pattern};
use lava_pipeline::{Action, ActionMeta, BuildContext, JobState, LavaError, TimeoutBudget};
use tracing::{info, warn};

use crate::command::run_host_command;

const SOFT_REBOOT_WAIT: Duration = Duration::from_secs(120);
const RESTART_MESSAGE: &str = "Will now restart";

fn uses_conmux(state: &JobState) -> bool {
  state
    .device
    .connection
    .command
    .as_deref()
    .is_some_and(|c| c.contains("conmux-console"))
}

/// Hard reset the device: the configured reset command, else conmux's
/// own `hardreset` over the console.
pub(crate) async fn hard_reset(state: &mut JobState, timeout: Duration) -> Result<(), LavaError> {
  if let Some(command) = state.device.commands.hard_reset.clone() {
    info!(command = %command, "hard_reset");
    run_host_command(&command, timeout).await?;
    return Ok(());
  }
  if uses_conmux(state) {
    info!("hard_reset via conmux");
    let connection = state.connection()?;
    connection.send("~$").await?;
    connection.send_line("hardreset").await?;
    return Ok(());
  }
  Err(LavaError::infrastructure(format!(
    "no hard reset method configured for {}",
    state.device.hostname
  )))
}

/// Powers the device on and opens its console, unless a connection was
/// handed to the job already.
pub struct ConnectDevice {
  meta: ActionMeta,
  has_command: bool,
}

impl ConnectDevice {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "connect-device",
        "use the configured command to connect serial to the device",
        "run connection command",
      ),
      has_command: false,
    })
  }
}

#[async_trait]
impl Action for ConnectDevice {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.has_command = build.device.connection.command.is_some();
    Ok(())
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    if state.connection.is_some() {
      info!(hostname = %state.device.hostname, "reusing existing connection");
      return Ok(());
    }
    if !self.has_command {
      return Err(LavaError::infrastructure(format!(
        "Unable to connect to {}: no connection command",
        state.device.hostname
      )));
    }
    if let Some(command) = state.device.commands.power_on.clone() {
      run_host_command(&command, self.meta.timeout()).await?;
      info!(hostname = %state.device.hostname, "power_on");
    }
    let console = Console::from_config(&state.device.hostname, &state.device.connection)?;
    state.set_connection(Box::new(console));
    Ok(())
  }
}

/// Reboots through the running system, falling back to a hard reset when
/// the restart message never shows.
pub struct ResetDevice {
  meta: ActionMeta,
}

impl ResetDevice {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "reset-device",
        "reboot or power-cycle the device",
        "reboot the device",
      ),
    })
  }
}

#[async_trait]
impl Action for ResetDevice {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let budget = TimeoutBudget::new(self.meta.timeout());
    if state.device.commands.hard_reset.is_some() {
      return hard_reset(state, budget.remaining()).await;
    }

    let cancel = state.cancel.clone();
    let connection = state.connection()?;
    connection.send_line("reboot").await?;
    let found = connection
      .expect(
        &[Pattern::literal(RESTART_MESSAGE), Pattern::Timeout],
        budget.cap(SOFT_REBOOT_WAIT),
        &cancel,
      )
      .await?;
    if found.index == 0 {
      info!("soft_reboot");
      return Ok(());
    }
    warn!("soft reboot failed, trying a hard reset");
    hard_reset(state, budget.remaining()).await
  }
}

/// Closes the console and switches the device off.
pub struct PowerOff {
  meta: ActionMeta,
}

impl PowerOff {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "power-off",
        "discontinue power to device",
        "send power_off command",
      )
      .with_timeout(Duration::from_secs(10)),
    })
  }

  async fn power_off(&self, state: &mut JobState) -> Result<(), LavaError> {
    if let Some(mut connection) = state.take_connection()
      && let Err(e) = connection.close().await
    {
      warn!(error = %e, "closing connection failed");
    }
    if let Some(command) = state.device.commands.power_off.clone() {
      run_host_command(&command, self.meta.timeout()).await?;
      info!(hostname = %state.device.hostname, "power_off");
    }
    Ok(())
  }
}

#[async_trait]
impl Action for PowerOff {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    self.power_off(state).await
  }

  async fn cleanup(&mut self, state: &mut JobState) {
    if let Err(e) = self.power_off(state).await {
      warn!(error = %e, "power off during cleanup failed");
    }
  }
}
