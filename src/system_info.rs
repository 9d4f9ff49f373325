// Copyright 2024-2026 the Gantry authors. MIT license.

use serde::Deserialize;
use serde::Serialize;

/// Host platform description used to decide whether an optional
/// package is installable at all. Values use the ecosystem's platform
/// vocabulary rather than Rust's.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemInfo {
  pub os: String,
  pub cpu: String,
}

impl Default for SystemInfo {
  fn default() -> Self {
    Self::from_rust(std::env::consts::OS, std::env::consts::ARCH)
  }
}

impl SystemInfo {
  pub fn from_rust(os: &str, cpu: &str) -> Self {
    Self {
      os: ecosystem_os(os).to_string(),
      cpu: ecosystem_cpu(cpu).to_string(),
    }
  }
}

/// Matches a manifest `os`/`cpu` list against a target. An empty list
/// matches everything; `!`-prefixed entries exclude; a list with only
/// exclusions matches anything not excluded.
pub(crate) fn matches_platform_list(items: &[String], target: &str) -> bool {
  if items.is_empty() {
    return true;
  }
  let mut had_negation = false;
  for item in items {
    if let Some(negated) = item.strip_prefix('!') {
      if negated == target {
        return false;
      }
      had_negation = true;
    } else if item == target {
      return true;
    }
  }
  had_negation
}

fn ecosystem_cpu(rust_arch: &str) -> &str {
  match rust_arch {
    "x86_64" => "x64",
    "aarch64" => "arm64",
    "x86" => "ia32",
    value => value,
  }
}

fn ecosystem_os(rust_os: &str) -> &str {
  match rust_os {
    "macos" => "darwin",
    "windows" => "win32",
    value => value,
  }
}
