use async_trait::async_trait;
use lava_config::{DeviceConfig, Parameters, Section};
use lava_pipeline::{Acceptance, Action, ActionMeta, BuildContext, LavaError, Pipeline, Strategy};

use super::download::DownloaderAction;
use super::environment::DeployDeviceEnvironment;
use super::extract::{ApplyOverlay, ExtractModules, ExtractNfsRootfs};
use super::overlay::OverlayAction;

/// Deploy to an NFS root served to the device.
pub struct NfsStrategy;

impl Strategy for NfsStrategy {
  fn name(&self) -> &'static str {
    "nfs"
  }

  fn section(&self) -> Section {
    Section::Deploy
  }

  fn accepts(&self, device: &DeviceConfig, parameters: &Parameters) -> Acceptance {
    let Some(to) = parameters.get("to") else {
      return Acceptance::reject("\"to\" is not in deploy parameters");
    };
    if to.as_str() != Some("nfs") {
      return Acceptance::reject("\"to\" parameter is not \"nfs\"");
    }
    let methods = &device.actions.deploy;
    if methods.contains("image") {
      return Acceptance::reject("\"image\" was in the device configuration deploy methods");
    }
    if methods.contains("nfs") {
      return Acceptance::accept();
    }
    Acceptance::reject("\"nfs\" was not in the device configuration deploy methods")
  }

  fn action(&self, parameters: &Parameters) -> Box<dyn Action> {
    NfsAction::new(parameters.clone())
  }
}

/// Downloads and unpacks the root filesystem and applies the overlay.
pub struct NfsAction {
  meta: ActionMeta,
  pipeline: Option<Pipeline>,
}

impl NfsAction {
  pub fn new(parameters: Parameters) -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "nfs-deploy",
        "deploy nfsrootfs",
        "NFS deployment",
      )
      .with_parameters(parameters),
      pipeline: None,
    })
  }
}

#[async_trait]
impl Action for NfsAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let mut pipeline = Pipeline::child(&self.meta);
    for label in ["nfsrootfs", "modules"] {
      if let Some(image) = self.meta.parameters.get(label) {
        pipeline.add_action(DownloaderAction::new(label, image), build)?;
      }
    }
    pipeline.add_action(ExtractNfsRootfs::new(), build)?;
    pipeline.add_action(OverlayAction::new(), build)?;
    pipeline.add_action(ExtractModules::new(), build)?;
    pipeline.add_action(ApplyOverlay::new(), build)?;
    if self.meta.parameters.contains_key("env_dut") {
      pipeline.add_action(DeployDeviceEnvironment::new(), build)?;
    }
    self.pipeline = Some(pipeline);
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    let params = &self.meta.parameters;
    if params.contains_key("nfsrootfs") && params.contains_key("persistent_nfs") {
      return vec!["Only one of nfsrootfs or persistent_nfs can be specified".to_string()];
    }
    Vec::new()
  }

  fn pipeline(&self) -> Option<&Pipeline> {
    self.pipeline.as_ref()
  }

  fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
    self.pipeline.as_mut()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn device(methods: &[&str]) -> DeviceConfig {
    let mut yaml = String::from("hostname: bbb-01\ndevice_type: beaglebone-black\nactions:\n  deploy:\n    methods:\n");
    for method in methods {
      yaml.push_str(&format!("      {method}: {{}}\n"));
    }
    DeviceConfig::from_yaml(&yaml).unwrap()
  }

  fn params(value: serde_json::Value) -> Parameters {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_accepts() {
    let nfs = NfsStrategy;
    let to_nfs = params(json!({"to": "nfs"}));
    assert!(nfs.accepts(&device(&["nfs"]), &to_nfs).accepted);
    assert_eq!(
      nfs.accepts(&device(&["nfs"]), &params(json!({}))).reason,
      "\"to\" is not in deploy parameters"
    );
    assert_eq!(
      nfs.accepts(&device(&["nfs"]), &params(json!({"to": "tmpfs"}))).reason,
      "\"to\" parameter is not \"nfs\""
    );
    assert!(!nfs.accepts(&device(&["nfs", "image"]), &to_nfs).accepted);
    assert_eq!(
      nfs.accepts(&device(&["tftp"]), &to_nfs).reason,
      "\"nfs\" was not in the device configuration deploy methods"
    );
  }
}
