//! Host-side commands: power control and archive handling.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use lava_pipeline::LavaError;
use tokio::process::Command;
use tracing::{debug, info};

/// Run a shell command on the dispatcher host. Returns its stdout.
pub async fn run_host_command(command: &str, timeout: Duration) -> Result<String, LavaError> {
  let mut cmd = Command::new("sh");
  cmd
    .arg("-c")
    .arg(command)
    .stdin(Stdio::null())
    .kill_on_drop(true);
  let output = run(cmd, command, timeout).await?;
  Ok(String::from_utf8_lossy(&output).into_owned())
}

/// Unpack `archive` into `dest`; tar picks the compression itself.
pub async fn extract_tarball(archive: &Path, dest: &Path, timeout: Duration) -> Result<(), LavaError> {
  tokio::fs::create_dir_all(dest).await.map_err(|e| {
    LavaError::infrastructure(format!("cannot create {}: {e}", dest.display()))
  })?;
  let mut cmd = Command::new("tar");
  cmd
    .arg("--numeric-owner")
    .arg("-C")
    .arg(dest)
    .arg("-xf")
    .arg(archive)
    .kill_on_drop(true);
  let label = format!("tar -xf {}", archive.display());
  run(cmd, &label, timeout).await?;
  info!(archive = %archive.display(), dest = %dest.display(), "archive extracted");
  Ok(())
}

/// Pack the contents of `source` into a gzipped tarball.
pub async fn create_tarball(source: &Path, archive: &Path, timeout: Duration) -> Result<(), LavaError> {
  let mut cmd = Command::new("tar");
  cmd
    .arg("--numeric-owner")
    .arg("-C")
    .arg(source)
    .arg("-czf")
    .arg(archive)
    .arg(".")
    .kill_on_drop(true);
  let label = format!("tar -czf {}", archive.display());
  run(cmd, &label, timeout).await?;
  Ok(())
}

async fn run(mut cmd: Command, label: &str, timeout: Duration) -> Result<Vec<u8>, LavaError> {
  debug!(command = label, "running host command");
  let output = tokio::time::timeout(timeout, cmd.output())
    .await
    .map_err(|_| LavaError::timeout(format!("{label} timed out after {}s", timeout.as_secs())))?
    .map_err(|e| LavaError::infrastructure(format!("cannot run {label}: {e}")))?;
  if !output.status.success() {
    return Err(LavaError::infrastructure(format!(
      "{label} failed with {}: {}",
      output.status,
      String::from_utf8_lossy(&output.stderr).trim_end()
    )));
  }
  Ok(output.stdout)
}
