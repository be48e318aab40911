use async_trait::async_trait;
use lava_pipeline::{Action, ActionMeta, BuildContext, LavaError, Pipeline};

use crate::boot::PowerOff;

/// Last action of every job. Its cleanup also runs after a failure, so
/// the device is released either way.
pub struct FinalizeAction {
  meta: ActionMeta,
  pipeline: Option<Pipeline>,
}

impl FinalizeAction {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "finalize",
        "finish the process and cleanup",
        "finalize the job",
      ),
      pipeline: None,
    })
  }
}

#[async_trait]
impl Action for FinalizeAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    let mut pipeline = Pipeline::child(&self.meta);
    pipeline.add_action(PowerOff::new(), build)?;
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
