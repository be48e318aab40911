//! Unpacking downloaded archives and applying the overlay.

use std::path::PathBuf;

use async_trait::async_trait;
use lava_pipeline::{Action, ActionMeta, BuildContext, JobState, LavaError};
use lava_testdef::copy_tree;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::command::{create_tarball, extract_tarball};
use crate::keys;

/// Unpacks `nfsrootfs` into the job directory, or records the export of a
/// `persistent_nfs` server.
pub struct ExtractNfsRootfs {
  meta: ActionMeta,
  dest: PathBuf,
}

impl ExtractNfsRootfs {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "extract-nfsrootfs",
        "unpack nfsrootfs",
        "unpack nfsrootfs, ready to apply lava overlay",
      ),
      dest: PathBuf::new(),
    })
  }

  fn persistent_address(&self) -> Option<&str> {
    match self.meta.parameters.get("persistent_nfs")? {
      Value::String(address) => Some(address),
      other => other.get("address").and_then(Value::as_str),
    }
  }
}

#[async_trait]
impl Action for ExtractNfsRootfs {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.dest = build.job_dir().join("nfsrootfs");
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    let params = &self.meta.parameters;
    match (params.contains_key("nfsrootfs"), params.contains_key("persistent_nfs")) {
      (false, false) => vec!["No nfsrootfs or persistent_nfs specified".to_string()],
      (false, true) if self.persistent_address().is_none() => {
        vec!["persistent_nfs has no address".to_string()]
      }
      _ => Vec::new(),
    }
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let level = self.meta.level.clone();
    if let Some(address) = self.persistent_address() {
      info!(address, "using persistent nfs");
      state.context.set(keys::nfs_root(), json!(address), &level);
      state.context.set(keys::persistent_nfs(), json!(true), &level);
      return Ok(());
    }

    let archive = PathBuf::from(state.context.require_str(&keys::downloaded_file("nfsrootfs"))?);
    extract_tarball(&archive, &self.dest, self.meta.timeout()).await?;

    let root = match self
      .meta
      .parameters
      .get("nfsrootfs")
      .and_then(|image| image.get("prefix"))
      .and_then(Value::as_str)
    {
      Some(prefix) => self.dest.join(prefix.trim_matches('/')),
      None => self.dest.clone(),
    };
    info!(root = %root.display(), "nfsrootfs_extracted");
    state
      .context
      .set(keys::nfs_root(), json!(root.display().to_string()), &level);
    state.context.set(keys::persistent_nfs(), json!(false), &level);
    Ok(())
  }
}

fn is_persistent(state: &JobState) -> bool {
  state
    .context
    .get(&keys::persistent_nfs())
    .and_then(Value::as_bool)
    .unwrap_or(false)
}

/// Unpacks the `modules` tarball into the extracted root.
pub struct ExtractModules {
  meta: ActionMeta,
}

impl ExtractModules {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "extract-modules",
        "extract supplied kernel modules",
        "extract kernel modules",
      ),
    })
  }
}

#[async_trait]
impl Action for ExtractModules {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    if !self.meta.parameters.contains_key("modules") {
      return Ok(());
    }
    if is_persistent(state) {
      warn!("not extracting modules into persistent nfs");
      return Ok(());
    }
    let archive = PathBuf::from(state.context.require_str(&keys::downloaded_file("modules"))?);
    let root = PathBuf::from(state.context.require_str(&keys::nfs_root())?);
    extract_tarball(&archive, &root, self.meta.timeout()).await?;
    info!(root = %root.display(), "modules_extracted");
    Ok(())
  }
}

/// Copies the overlay into the extracted root.
pub struct ApplyOverlay {
  meta: ActionMeta,
}

impl ApplyOverlay {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "apply-overlay",
        "apply the overlay to the nfsrootfs",
        "apply overlay",
      ),
    })
  }
}

#[async_trait]
impl Action for ApplyOverlay {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    if is_persistent(state) {
      warn!("overlay is not applied to persistent nfs");
      return Ok(());
    }
    let overlay = PathBuf::from(state.context.require_str(&keys::overlay_dir())?);
    let root = PathBuf::from(state.context.require_str(&keys::nfs_root())?);
    copy_tree(&overlay, &root).await?;
    info!(root = %root.display(), "overlay_applied");
    Ok(())
  }
}

/// Packs the overlay so a boot method can hand it to the target.
pub struct CompressOverlay {
  meta: ActionMeta,
  archive: PathBuf,
}

impl CompressOverlay {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "compress-overlay",
        "Create a lava overlay tarball and store alongside the job",
        "Compress the lava overlay files",
      ),
      archive: PathBuf::new(),
    })
  }
}

#[async_trait]
impl Action for CompressOverlay {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.archive = build.job_dir().join("overlay.tar.gz");
    Ok(())
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let overlay = PathBuf::from(state.context.require_str(&keys::overlay_dir())?);
    create_tarball(&overlay, &self.archive, self.meta.timeout()).await?;
    state.context.set(
      keys::overlay_tarball(),
      json!(self.archive.display().to_string()),
      &self.meta.level,
    );
    Ok(())
  }
}
