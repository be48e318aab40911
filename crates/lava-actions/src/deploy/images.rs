use async_trait::async_trait;
use lava_config::{DeviceConfig, Parameters, Section};
use lava_pipeline::{Acceptance, Action, ActionMeta, BuildContext, LavaError, Pipeline, Strategy};
use serde_json::Value;

use super::download::DownloaderAction;
use super::environment::DeployDeviceEnvironment;
use super::extract::CompressOverlay;
use super::overlay::OverlayAction;

/// Deploy images to dispatcher storage for an emulated device.
pub struct ImagesStrategy;

impl Strategy for ImagesStrategy {
  fn name(&self) -> &'static str {
    "images"
  }

  fn section(&self) -> Section {
    Section::Deploy
  }

  fn accepts(&self, device: &DeviceConfig, parameters: &Parameters) -> Acceptance {
    let Some(to) = parameters.get("to") else {
      return Acceptance::reject("\"to\" is not in deploy parameters");
    };
    if to.as_str() != Some("tmpfs") {
      return Acceptance::reject("\"to\" parameter is not \"tmpfs\"");
    }
    if !device.actions.deploy.contains("image") {
      return Acceptance::reject("\"image\" was not in the device configuration deploy methods");
    }
    Acceptance::accept()
  }

  fn action(&self, parameters: &Parameters) -> Box<dyn Action> {
    DeployImagesAction::new(parameters.clone())
  }
}

/// One download per image, then the overlay when the job runs tests.
pub struct DeployImagesAction {
  meta: ActionMeta,
  pipeline: Option<Pipeline>,
}

impl DeployImagesAction {
  pub fn new(parameters: Parameters) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "deployimages",
        "deploy images using guestfs",
        "deploy images",
      )
      .with_parameters(parameters),
      pipeline: None,
    })
  }

  fn images(&self) -> Option<&serde_json::Map<String, Value>> {
    self.meta.parameters.get("images").and_then(Value::as_object)
  }
}

#[async_trait]
impl Action for DeployImagesAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let mut pipeline = Pipeline::child(&self.meta);
    if let Some(images) = self.images() {
      for (label, image) in images {
        pipeline.add_action(DownloaderAction::new(label, image), build)?;
      }
    }
    if build.job.has_tests() {
      pipeline.add_action(OverlayAction::new(), build)?;
      pipeline.add_action(CompressOverlay::new(), build)?;
    }
    if self.meta.parameters.contains_key("env_dut") {
      pipeline.add_action(DeployDeviceEnvironment::new(), build)?;
    }
    self.pipeline = Some(pipeline);
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    match self.images() {
      Some(images) if !images.is_empty() => Vec::new(),
      _ => vec!["No images specified in deploy parameters".to_string()],
    }
  }

  fn pipeline(&self) -> Option<&Pipeline> {
    self.pipeline.as_ref()
  }

  fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
    self.pipeline.as_mut()
  }
}
