use std::collections::BTreeMap;

use async_trait::async_trait;
use lava_config::{DeviceConfig, Parameters, Section};
use lava_connection::Console;
use lava_pipeline::{
  Acceptance, Action, ActionMeta, BuildContext, JobState, LavaError, Pipeline, Strategy,
};
use serde_json::{Value, json};
use tracing::info;

use super::login::AutoLoginAction;
use super::needs_login;
use crate::keys;
use crate::template::render;

/// Boot an emulated device with QEMU.
pub struct QemuStrategy;

impl Strategy for QemuStrategy {
  fn name(&self) -> &'static str {
    "qemu"
  }

  fn section(&self) -> Section {
    Section::Boot
  }

  fn accepts(&self, device: &DeviceConfig, parameters: &Parameters) -> Acceptance {
    let Some(method) = parameters.get("method") else {
      return Acceptance::reject("\"method\" was not in the boot parameters");
    };
    if method.as_str() != Some("qemu") {
      return Acceptance::reject("\"method\" was not \"qemu\"");
    }
    if !device.actions.boot.contains("qemu") {
      return Acceptance::reject("\"qemu\" was not in the device configuration boot methods");
    }
    Acceptance::accept()
  }

  fn action(&self, parameters: &Parameters) -> Box<dyn Action> {
    BootQemuAction::new(parameters.clone())
  }
}

pub struct BootQemuAction {
  meta: ActionMeta,
  pipeline: Option<Pipeline>,
}

impl BootQemuAction {
  pub fn new(parameters: Parameters) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "boot-qemu-image",
        "boot image with retry",
        "boot with retry",
      )
      .with_parameters(parameters),
      pipeline: None,
    })
  }
}

#[async_trait]
impl Action for BootQemuAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let mut pipeline = Pipeline::child(&self.meta);
    pipeline.add_action(CallQemuAction::new(), build)?;
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

/// Renders the device's QEMU command line and runs it as the console.
pub struct CallQemuAction {
  meta: ActionMeta,
  command: Option<String>,
  labels: Vec<String>,
}

impl CallQemuAction {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "execute-qemu",
        "call qemu to boot the image",
        "execute qemu to boot the image",
      ),
      command: None,
      labels: Vec::new(),
    })
  }

  fn render_context(&self, state: &JobState) -> Value {
    let images: BTreeMap<&str, &str> = self
      .labels
      .iter()
      .filter_map(|label| {
        let path = state.context.get_str(&keys::downloaded_file(label))?;
        Some((label.as_str(), path))
      })
      .collect();
    json!({
      "job_id": state.job_id,
      "images": images,
      "overlay": state.context.get_str(&keys::overlay_tarball()),
    })
  }
}

#[async_trait]
impl Action for CallQemuAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.command = build
      .device
      .actions
      .boot
      .parameters("qemu")
      .and_then(|params| params.get("command"))
      .and_then(Value::as_str)
      .map(str::to_string);
    self.labels = build
      .job
      .blocks(Section::Deploy)
      .filter_map(|spec| spec.parameters.get("images"))
      .filter_map(Value::as_object)
      .flat_map(|images| images.keys().cloned())
      .collect();
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    match &self.command {
      Some(command) if !command.trim().is_empty() => Vec::new(),
      _ => vec!["No qemu command in the device configuration".to_string()],
    }
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let template = self
      .command
      .as_deref()
      .ok_or_else(|| LavaError::job("No qemu command in the device configuration"))?;
    let command = render(&self.meta.name, template, &self.render_context(state))?;
    info!(command = %command, "qemu_started");

    let mut config = state.device.connection.clone();
    config.command = Some(command);
    let console = Console::from_config(&state.device.hostname, &config)?;
    state.set_connection(Box::new(console));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use lava_config::DispatcherConfig;
  use lava_pipeline::{Context, NoopNotifier};
  use tokio_util::sync::CancellationToken;

  use super::*;

  #[test]
  fn test_render_context() {
    let device = DeviceConfig::from_yaml("hostname: kvm01\ndevice_type: qemu\n").unwrap();
    let mut state = JobState::new(
      "42",
      Arc::new(device),
      Arc::new(DispatcherConfig::default()),
      CancellationToken::new(),
      Arc::new(NoopNotifier),
    );
    state.context = Context::new();
    state
      .context
      .set(keys::downloaded_file("rootfs"), json!("/tmp/42/rootfs.img"), "1.1");
    let action = CallQemuAction {
      meta: ActionMeta::new("execute-qemu", "", ""),
      command: Some("qemu-system-x86_64 -hda {{ images.rootfs }}".to_string()),
      labels: vec!["rootfs".to_string(), "kernel".to_string()],
    };

    let context = action.render_context(&state);
    let command = render("execute-qemu", action.command.as_deref().unwrap(), &context).unwrap();
    assert_eq!(command, "qemu-system-x86_64 -hda /tmp/42/rootfs.img");
    assert_eq!(context["images"].as_object().unwrap().len(), 1);
  }
}
