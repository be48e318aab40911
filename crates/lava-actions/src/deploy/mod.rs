//! Deploy strategies and the actions they assemble.

mod download;
mod environment;
mod extract;
mod images;
mod nfs;
mod overlay;

pub use download::DownloaderAction;
pub use environment::{DeployDeviceEnvironment, env_vars};
pub use extract::{ApplyOverlay, CompressOverlay, ExtractModules, ExtractNfsRootfs};
pub use images::{DeployImagesAction, ImagesStrategy};
pub use nfs::{NfsAction, NfsStrategy};
pub use overlay::OverlayAction;
pub(crate) use overlay::overlay_builder;
