//! Per-OS deployment profiles.
//!
//! The profile decides where the overlay lives on the target, which shell
//! runs the helper scripts and how the test runner is started at boot. A
//! profile is chosen from the deploy action's `os` parameter when the
//! pipeline is built.

use serde::{Deserialize, Serialize};

/// How the test runner gets started when the target boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupStyle {
  /// Upstart job in `/etc/init/`.
  Upstart,
  /// SysV script in `/etc/init.d/` plus rc links.
  InitD,
  /// Appended to `/system/etc/mkshrc` (Android).
  Mkshrc,
  /// The dispatcher starts the runner over the console.
  Console,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentData {
  pub distro: String,
  /// Interpreter written into the helper scripts' shebang.
  pub lava_test_sh_cmd: String,
  /// Root of the overlay on the target.
  pub lava_test_dir: String,
  pub lava_test_results_dir: String,
  /// Which partition of the device holds the results.
  pub lava_test_results_part_attr: String,
  pub line_separator: String,
  pub startup: StartupStyle,
}

impl DeploymentData {
  /// The profile for an `os` value, `None` when unsupported.
  pub fn for_os(os: &str) -> Option<Self> {
    match os {
      "debian" => Some(Self::posix("debian", "/bin/bash", StartupStyle::Console)),
      "ubuntu" => Some(Self::posix("ubuntu", "/bin/bash", StartupStyle::Upstart)),
      "oe" => Some(Self::posix("oe", "/bin/sh", StartupStyle::InitD)),
      "fedora" => Some(Self::posix("fedora", "/bin/bash", StartupStyle::Console)),
      "centos" => Some(Self::posix("centos", "/bin/bash", StartupStyle::Console)),
      "android" => Some(Self {
        distro: "android".to_string(),
        lava_test_sh_cmd: "/system/bin/mksh".to_string(),
        lava_test_dir: "/data/lava".to_string(),
        lava_test_results_dir: "/data/lava/results".to_string(),
        lava_test_results_part_attr: "data_part_android_org".to_string(),
        line_separator: "\r\n".to_string(),
        startup: StartupStyle::Mkshrc,
      }),
      _ => None,
    }
  }

  fn posix(distro: &str, shell: &str, startup: StartupStyle) -> Self {
    Self {
      distro: distro.to_string(),
      lava_test_sh_cmd: shell.to_string(),
      lava_test_dir: "/lava".to_string(),
      lava_test_results_dir: "/lava/results".to_string(),
      lava_test_results_part_attr: "root_part".to_string(),
      line_separator: "\n".to_string(),
      startup,
    }
  }

  pub fn supported_os() -> &'static [&'static str] {
    &["debian", "ubuntu", "oe", "fedora", "centos", "android"]
  }
}

impl Default for DeploymentData {
  fn default() -> Self {
    Self::posix("debian", "/bin/bash", StartupStyle::Console)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_profiles() {
    let android = DeploymentData::for_os("android").unwrap();
    assert_eq!(android.lava_test_dir, "/data/lava");
    assert_eq!(android.lava_test_sh_cmd, "/system/bin/mksh");

    let oe = DeploymentData::for_os("oe").unwrap();
    assert_eq!(oe.startup, StartupStyle::InitD);
    assert_eq!(oe.lava_test_dir, "/lava");

    assert!(DeploymentData::for_os("plan9").is_none());
    for os in DeploymentData::supported_os() {
      assert!(DeploymentData::for_os(os).is_some(), "{os} has a profile");
    }
  }
}
