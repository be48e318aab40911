use std::time::Duration;

use async_trait::async_trait;
use lava_config::{DeviceConfig, MethodSet, Parameters, Section};
use lava_connection::Pattern;
use lava_pipeline::{
  Acceptance, Action, ActionMeta, BuildContext, JobState, LavaError, Pipeline, Strategy,
  TimeoutBudget,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::login::AutoLoginAction;
use super::needs_login;
use super::power::{ConnectDevice, ResetDevice, hard_reset};
use crate::keys;
use crate::template::render;

const METHOD: &str = "u-boot";
const DEFAULT_INTERRUPT_PROMPT: &str = "Hit any key to stop autoboot";
const PROMPT_WAIT: Duration = Duration::from_secs(300);

/// Boot a board through its U-Boot bootloader.
pub struct UBootStrategy;

impl Strategy for UBootStrategy {
  fn name(&self) -> &'static str {
    METHOD
  }

  fn section(&self) -> Section {
    Section::Boot
  }

  fn accepts(&self, device: &DeviceConfig, parameters: &Parameters) -> Acceptance {
    let Some(method) = parameters.get("method") else {
      return Acceptance::reject("\"method\" was not in the boot parameters");
    };
    if method.as_str() != Some(METHOD) {
      return Acceptance::reject("\"method\" was not \"u-boot\"");
    }
    if !device.actions.boot.contains(METHOD) {
      return Acceptance::reject("\"u-boot\" was not in the device configuration boot methods");
    }
    Acceptance::accept()
  }

  fn action(&self, parameters: &Parameters) -> Box<dyn Action> {
    UBootAction::new(parameters.clone())
  }
}

pub struct UBootAction {
  meta: ActionMeta,
  pipeline: Option<Pipeline>,
}

impl UBootAction {
  pub fn new(parameters: Parameters) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "uboot-action",
        "interrupt uboot and pass commands",
        "pass uboot commands",
      )
      .with_parameters(parameters),
      pipeline: None,
    })
  }
}

#[async_trait]
impl Action for UBootAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let mut pipeline = Pipeline::child(&self.meta);
    pipeline.add_action(ConnectDevice::new(), build)?;
    pipeline.add_action(ResetDevice::new(), build)?;
    pipeline.add_action(BootloaderInterrupt::new(), build)?;
    pipeline.add_action(BootloaderCommands::new(), build)?;
    if needs_login(&self.meta.parameters, build) {
      pipeline.add_action(AutoLoginAction::new(), build)?;
    }
    self.pipeline = Some(pipeline);
    Ok(())
  }

  fn pipeline(&self) -> Option<&Pipeline> {
    self.pipeline.as_ref()
  }

  fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
    self.pipeline.as_mut()
  }
}

fn device_param(boot: &MethodSet, key: &str) -> Option<String> {
  boot
    .parameters(METHOD)
    .and_then(|params| params.get(key))
    .and_then(Value::as_str)
    .map(str::to_string)
}

/// Stops autoboot at the bootloader prompt. When the interrupt prompt
/// never appears the board is hard reset and given one more chance.
pub struct BootloaderInterrupt {
  meta: ActionMeta,
  interrupt_prompt: String,
  bootloader_prompt: Option<String>,
  wait: Duration,
}

impl BootloaderInterrupt {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "bootloader-interrupt",
        "interrupt bootloader",
        "interrupt bootloader to get a prompt",
      ),
      interrupt_prompt: DEFAULT_INTERRUPT_PROMPT.to_string(),
      bootloader_prompt: None,
      wait: PROMPT_WAIT,
    })
  }
}

#[async_trait]
impl Action for BootloaderInterrupt {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let boot = &build.device.actions.boot;
    if let Some(prompt) = device_param(boot, "interrupt_prompt") {
      self.interrupt_prompt = prompt;
    }
    self.bootloader_prompt = device_param(boot, "bootloader_prompt");
    self.wait = build.connection_timeout();
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    match self.bootloader_prompt {
      Some(_) => Vec::new(),
      None => vec!["Unable to find bootloader_prompt in the device configuration".to_string()],
    }
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let budget = TimeoutBudget::new(self.meta.timeout());
    let cancel = state.cancel.clone();
    let patterns = [Pattern::literal(self.interrupt_prompt.as_str()), Pattern::Timeout];

    for attempt in 0..2 {
      let found = state
        .connection()?
        .expect(&patterns, budget.cap(self.wait), &cancel)
        .await?;
      if found.index == 0 {
        break;
      }
      if attempt == 1 {
        return Err(LavaError::timeout(format!(
          "bootloader interrupt prompt '{}' not seen",
          self.interrupt_prompt
        )));
      }
      warn!(prompt = %self.interrupt_prompt, "interrupt prompt not seen, resetting");
      hard_reset(state, budget.remaining()).await?;
    }

    let connection = state.connection()?;
    connection.send_line("").await?;
    if let Some(prompt) = &self.bootloader_prompt {
      connection
        .expect(&[Pattern::literal(prompt.as_str())], budget.cap(self.wait), &cancel)
        .await?;
    }
    info!("bootloader_interrupted");
    Ok(())
  }
}

/// Sends the boot commands, one per bootloader prompt.
pub struct BootloaderCommands {
  meta: ActionMeta,
  commands: Vec<String>,
  bootloader_prompt: String,
  boot_message: Option<String>,
}

impl BootloaderCommands {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "bootloader-commands",
        "send commands to bootloader",
        "interactive bootloader",
      ),
      commands: Vec::new(),
      bootloader_prompt: String::new(),
      boot_message: None,
    })
  }

  /// The job's `commands`: a list, or the name of a command block in the
  /// device's u-boot method.
  fn resolve_commands(&self, boot: &MethodSet) -> Result<Vec<String>, String> {
    let strings = |value: &Value| -> Option<Vec<String>> {
      value
        .as_array()
        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
    };
    match self.meta.parameters.get("commands") {
      None => Err("\"commands\" was not in the boot parameters".to_string()),
      Some(Value::String(block)) => boot
        .get(METHOD)
        .and_then(|method| method.get(block))
        .and_then(|b| b.get("commands"))
        .and_then(strings)
        .ok_or_else(|| format!("No commands named '{block}' in the device configuration")),
      Some(value) => strings(value).ok_or_else(|| "\"commands\" must be a list or a name".to_string()),
    }
  }
}

#[async_trait]
impl Action for BootloaderCommands {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let boot = &build.device.actions.boot;
    match self.resolve_commands(boot) {
      Ok(commands) => self.commands = commands,
      Err(e) => self.meta.build_errors.push(e),
    }
    self.bootloader_prompt = device_param(boot, "bootloader_prompt").unwrap_or_default();
    self.boot_message = device_param(boot, "boot_message");
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    if self.meta.build_errors.is_empty() && self.commands.is_empty() {
      return vec!["No bootloader commands to send".to_string()];
    }
    Vec::new()
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let budget = TimeoutBudget::new(self.meta.timeout());
    let cancel = state.cancel.clone();
    let vars = json!({
      "NFSROOTFS": state.context.get_str(&keys::nfs_root()).unwrap_or_default(),
      "job_id": state.job_id,
    });
    let commands = self
      .commands
      .iter()
      .map(|command| render(&self.meta.name, command, &vars))
      .collect::<Result<Vec<_>, _>>()?;

    let prompt = [Pattern::literal(self.bootloader_prompt.as_str())];
    let connection = state.connection()?;
    for (i, command) in commands.iter().enumerate() {
      if i > 0 {
        connection.expect(&prompt, budget.cap(PROMPT_WAIT), &cancel).await?;
      }
      debug!(command = %command, "bootloader command");
      connection.send_line(command).await?;
    }
    if let Some(message) = &self.boot_message {
      connection
        .expect(&[Pattern::literal(message.as_str())], budget.remaining(), &cancel)
        .await?;
    }
    info!(count = commands.len(), "bootloader_commands_sent");
    Ok(())
  }
}
