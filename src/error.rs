// Copyright 2024-2026 the Gantry authors. MIT license.

use deno_semver::Version;
use thiserror::Error;

use crate::registry::RegistryPackageInfoLoadError;

/// A condition caused by user input (manifest contents, flags, the
/// state of the working directory). Surfaced verbatim; never a bug.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct UserError(pub String);

/// No concrete version can satisfy what was asked for.
#[derive(Debug, Error, Clone)]
pub enum ConstraintError {
  #[error(
    "Could not find a version of '{name}' matching '{version_req}'. Found: {}",
    format_candidates(.candidates)
  )]
  NoVersionMatched {
    name: String,
    version_req: String,
    candidates: Vec<Version>,
  },
  #[error("Could not find dist-tag '{dist_tag}' for package '{name}'.")]
  DistTagNotFound { name: String, dist_tag: String },
  #[error(
    "Could not find version '{version}' referenced in dist-tag '{dist_tag}' for package '{name}'."
  )]
  DistTagVersionNotFound {
    name: String,
    dist_tag: String,
    version: String,
  },
}

fn format_candidates(candidates: &[Version]) -> String {
  if candidates.is_empty() {
    "no versions".to_string()
  } else {
    candidates
      .iter()
      .map(|v| v.to_string())
      .collect::<Vec<_>>()
      .join(", ")
  }
}

/// A single package name whose collapsible patterns cannot agree on
/// one version under flat resolution. The caller decides how to
/// surface the choice.
#[derive(Debug, Clone)]
pub struct FlatConflict {
  pub name: String,
  /// The patterns that could not be collapsed, with the version each
  /// currently resolves to.
  pub conflicting: Vec<(String, Version)>,
}

/// A spawned helper process exited non-zero. The exit code becomes the
/// run's exit code.
#[derive(Debug, Error, Clone)]
#[error("helper process exited with code {code}")]
pub struct ProcessTermError {
  pub code: i32,
}

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error(transparent)]
  User(#[from] UserError),
  #[error(transparent)]
  Constraint(#[from] ConstraintError),
  #[error(transparent)]
  Network(#[from] RegistryPackageInfoLoadError),
  #[error(transparent)]
  ProcessTerm(#[from] ProcessTermError),
  #[error(transparent)]
  Unexpected(#[from] anyhow::Error),
}

impl ResolveError {
  /// The exit code the outer driver should terminate with. Helper
  /// process failures pass their code through; everything else is a
  /// generic failure.
  pub fn exit_code(&self) -> i32 {
    match self {
      ResolveError::ProcessTerm(err) => err.code,
      _ => 1,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn constraint_error_lists_candidates() {
    let err = ConstraintError::NoVersionMatched {
      name: "a".to_string(),
      version_req: "^2.0.0".to_string(),
      candidates: vec![
        Version::parse_from_npm("1.0.0").unwrap(),
        Version::parse_from_npm("1.1.0").unwrap(),
      ],
    };
    assert_eq!(
      err.to_string(),
      "Could not find a version of 'a' matching '^2.0.0'. Found: 1.0.0, 1.1.0"
    );
  }

  #[test]
  fn exit_codes() {
    assert_eq!(
      ResolveError::from(UserError("bad".to_string())).exit_code(),
      1
    );
    assert_eq!(
      ResolveError::from(ProcessTermError { code: 7 }).exit_code(),
      7
    );
  }
}
