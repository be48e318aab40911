//! Lava Testdef
//!
//! Test definitions from URL, VCS repository or inline documents, turned
//! into the overlay the target runs:
//!
//! - [`TestDefinitionLoader`] fetches definitions in job order and gives each
//!   its `{index}_{name}` run id.
//! - [`TestDefinition::copy_test`] writes `testdef.yaml`, `install.sh` and
//!   `run.sh` (wrapped in the STARTRUN/ENDRUN handshake).
//! - [`OverlayBuilder`] installs the helper scripts, runner configuration and
//!   startup hooks for the deployment profile.
//! - [`PatternFixup`] turns captured output back into test results.

mod definition;
mod error;
mod fetch;
mod loader;
mod overlay;
mod pattern;
mod script;

pub use definition::{CopyOptions, TestDefinition, TestSource, copy_tree, valid_name};
pub use error::{FetchError, LoadError};
pub use fetch::{BzrFetcher, Checkout, Download, Fetchers, GitFetcher, UrlFetcher, Vcs, VcsFetcher};
pub use loader::{RepoLocator, TestDefinitionLoader, read_document};
pub use overlay::{OverlayBuilder, SCRIPT_MODE};
pub use pattern::{DEFAULT_PATTERN, PatternFixup};
pub use script::{
  ACK_FIFO, ACK_TIMEOUT_SECS, SkipInstall, SkipSet, install_script, parameter_lines, run_script,
};
