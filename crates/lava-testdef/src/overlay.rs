//! The on-target overlay: helper scripts, test directories, runner
//! configuration and startup hooks, laid out under a host directory that
//! mirrors the target's root filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lava_config::{DeploymentData, StartupStyle};
use tracing::{debug, info};

use crate::error::LoadError;
use crate::script::ACK_FIFO;

/// Mode of every installed script: rwxr-xr-x.
pub const SCRIPT_MODE: u32 = 0o755;

const SCRIPTS: &[(&str, &str)] = &[
  ("lava-test-runner", include_str!("../scripts/lava-test-runner")),
  ("lava-test-shell", include_str!("../scripts/lava-test-shell")),
  ("lava-test-case", include_str!("../scripts/lava-test-case")),
  ("lava-test-case-attach", include_str!("../scripts/lava-test-case-attach")),
  ("lava-add-keys", include_str!("../scripts/lava-add-keys")),
  ("lava-add-sources", include_str!("../scripts/lava-add-sources")),
  ("lava-install-packages", include_str!("../scripts/lava-install-packages")),
];

const INIT_D_SCRIPT: &str = include_str!("../scripts/lava-test-runner.init.d");

/// Builds the overlay for one deployment profile.
#[derive(Debug, Clone)]
pub struct OverlayBuilder {
  root: PathBuf,
  deployment: DeploymentData,
}

impl OverlayBuilder {
  pub fn new(root: impl Into<PathBuf>, deployment: DeploymentData) -> Self {
    Self {
      root: root.into(),
      deployment,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Host path of a target path.
  pub fn host_path(&self, target: &str) -> PathBuf {
    self.root.join(target.trim_start_matches('/'))
  }

  /// Host path of `{lava_test_dir}`.
  pub fn lava_dir(&self) -> PathBuf {
    self.host_path(&self.deployment.lava_test_dir)
  }

  /// Where the runner reads its list of test directories. Android keeps
  /// it under the lava directory since `/etc` is read-only there.
  pub fn runner_conf_target(&self) -> String {
    match self.deployment.startup {
      StartupStyle::Mkshrc => format!("{}/lava-test-runner.conf", self.deployment.lava_test_dir),
      _ => "/etc/lava-test-runner.conf".to_string(),
    }
  }

  /// Host and target directory for a test run.
  pub fn test_dir(&self, run_id: &str) -> (PathBuf, String) {
    let target = format!("{}/tests/{run_id}", self.deployment.lava_test_dir);
    (self.host_path(&target), target)
  }

  fn prelude(&self) -> String {
    let d = &self.deployment;
    format!(
      "#!{shell}\n\n\
       ACK_FIFO={ACK_FIFO}\n\
       LAVA_TEST_DIR={dir}\n\
       LAVA_TEST_RESULTS_DIR={results}\n\
       LAVA_TEST_SH_CMD={shell}\n\
       LAVA_RUNNER_CONF={conf}\n\n",
      shell = d.lava_test_sh_cmd,
      dir = d.lava_test_dir,
      results = d.lava_test_results_dir,
      conf = self.runner_conf_target(),
    )
  }

  /// Create `bin/` with the helper scripts and an empty `tests/`.
  pub async fn prepare(&self) -> Result<(), LoadError> {
    let lava_dir = self.lava_dir();
    let bin = lava_dir.join("bin");
    let tests = lava_dir.join("tests");
    create_dir(&bin).await?;
    if tokio::fs::try_exists(&tests).await.unwrap_or(false) {
      tokio::fs::remove_dir_all(&tests)
        .await
        .map_err(|e| LoadError::io(&tests, e))?;
    }
    create_dir(&tests).await?;

    let prelude = self.prelude();
    for (name, body) in SCRIPTS {
      write_script(&bin.join(name), &format!("{prelude}{body}")).await?;
    }
    info!(
      lava_dir = %lava_dir.display(),
      distro = %self.deployment.distro,
      scripts = SCRIPTS.len(),
      "overlay prepared"
    );
    Ok(())
  }

  /// Write the runner configuration listing test directories in run order.
  pub async fn write_runner_conf(&self, target_dirs: &[String]) -> Result<(), LoadError> {
    let path = self.host_path(&self.runner_conf_target());
    let mut content = String::new();
    for dir in target_dirs {
      content.push_str(dir);
      content.push('\n');
    }
    write_file(&path, &content).await
  }

  /// Install the hook that starts the runner when the target boots.
  pub async fn configure_startup(&self) -> Result<(), LoadError> {
    let runner = format!("{}/bin/lava-test-runner", self.deployment.lava_test_dir);
    match self.deployment.startup {
      StartupStyle::Upstart => {
        let conf = format!(
          "description \"lava test runner\"\n\
           start on started networking\n\
           console output\n\
           task\n\
           exec {runner}\n"
        );
        write_file(&self.root.join("etc/init/lava-test-runner.conf"), &conf).await?;
      }
      StartupStyle::InitD => {
        let script = format!("{}{INIT_D_SCRIPT}", self.prelude());
        write_script(&self.root.join("etc/init.d/lava-test-runner"), &script).await?;
        write_script(&self.root.join("etc/rc5.d/S50lava-test-runner"), &script).await?;
        write_script(&self.root.join("etc/rc6.d/K50lava-test-runner"), &script).await?;
      }
      StartupStyle::Mkshrc => {
        let path = self.root.join("system/etc/mkshrc");
        let mut content = match tokio::fs::read_to_string(&path).await {
          Ok(existing) => existing,
          Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
          Err(e) => return Err(LoadError::io(&path, e)),
        };
        content.push_str(&format!("\n{runner}\n"));
        write_file(&path, &content).await?;
      }
      StartupStyle::Console => {
        debug!("runner is started over the console, no startup hook");
      }
    }
    Ok(())
  }

  /// `{lava_test_dir}/environment`, sourced by the runner.
  pub async fn write_environment(&self, vars: &BTreeMap<String, String>) -> Result<(), LoadError> {
    let mut content = String::new();
    for (key, value) in vars {
      content.push_str(&format!("export {key}='{}'\n", value.replace('\'', r"'\''")));
    }
    write_file(&self.lava_dir().join("environment"), &content).await
  }
}

async fn create_dir(path: &Path) -> Result<(), LoadError> {
  tokio::fs::create_dir_all(path)
    .await
    .map_err(|e| LoadError::io(path, e))
}

async fn write_file(path: &Path, content: &str) -> Result<(), LoadError> {
  if let Some(parent) = path.parent() {
    create_dir(parent).await?;
  }
  tokio::fs::write(path, content)
    .await
    .map_err(|e| LoadError::io(path, e))
}

async fn write_script(path: &Path, content: &str) -> Result<(), LoadError> {
  write_file(path, content).await?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(SCRIPT_MODE))
      .await
      .map_err(|e| LoadError::io(path, e))?;
  }
  Ok(())
}
