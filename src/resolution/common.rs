// Copyright 2024-2026 the Gantry authors. MIT license.

use deno_semver::npm::NpmVersionReqParseError;
use deno_semver::Version;
use deno_semver::VersionReq;
use once_cell::sync::Lazy;

use crate::error::ConstraintError;
use crate::registry::PackageInfo;
use crate::registry::VersionInfo;

pub static LATEST_VERSION_REQ: Lazy<VersionReq> =
  Lazy::new(|| VersionReq::parse_from_specifier("latest").unwrap());

/// Parses a pattern range into a version requirement. The `latest`
/// alias becomes a tag requirement.
pub fn parse_range(range: &str) -> Result<VersionReq, NpmVersionReqParseError> {
  if range == "latest" {
    return Ok(LATEST_VERSION_REQ.clone());
  }
  VersionReq::parse_from_npm(range)
}

/// Parses a concrete version, loose mode permitting lenient npm forms
/// (leading `v`, leading zeros).
pub fn parse_version(text: &str, loose_semver: bool) -> Option<Version> {
  if loose_semver {
    Version::parse_from_npm(text).ok()
  } else {
    Version::parse_standard(text).ok()
  }
}

/// Whether a concrete version satisfies a range string. Tags and
/// unparseable ranges never satisfy; they need registry metadata.
pub fn range_satisfies(range: &str, version: &Version) -> bool {
  match parse_range(range) {
    Ok(req) => req.tag().is_none() && req.matches(version),
    Err(_) => false,
  }
}

/// The constraint reducer: picks the highest version satisfying the
/// requirement, or follows the dist-tag for tag requirements.
pub fn resolve_best_version_info<'info>(
  version_req: &VersionReq,
  package_info: &'info PackageInfo,
) -> Result<&'info VersionInfo, ConstraintError> {
  if let Some(tag) = version_req.tag() {
    return tag_to_version_info(package_info, tag);
  }

  let mut maybe_best_version: Option<&VersionInfo> = None;
  for version_info in package_info.versions.values() {
    if version_req.matches(&version_info.version) {
      let is_best_version = maybe_best_version
        .as_ref()
        .map(|best| best.version.cmp(&version_info.version).is_lt())
        .unwrap_or(true);
      if is_best_version {
        maybe_best_version = Some(version_info);
      }
    }
  }

  match maybe_best_version {
    Some(info) => Ok(info),
    None => {
      let mut candidates: Vec<Version> =
        package_info.versions.keys().cloned().collect();
      candidates.sort();
      Err(ConstraintError::NoVersionMatched {
        name: package_info.name.clone(),
        version_req: version_req.version_text().to_string(),
        candidates,
      })
    }
  }
}

fn tag_to_version_info<'a>(
  info: &'a PackageInfo,
  tag: &str,
) -> Result<&'a VersionInfo, ConstraintError> {
  if let Some(version) = info.dist_tags.get(tag) {
    return match info.versions.get(version) {
      Some(version_info) => Ok(version_info),
      None => Err(ConstraintError::DistTagVersionNotFound {
        name: info.name.clone(),
        dist_tag: tag.to_string(),
        version: version.to_string(),
      }),
    };
  }
  if tag == "latest" {
    // registries (and test fixtures) may omit the tag map entirely;
    // fall back to the highest published version
    return info
      .versions
      .values()
      .max_by(|a, b| a.version.cmp(&b.version))
      .ok_or_else(|| ConstraintError::NoVersionMatched {
        name: info.name.clone(),
        version_req: "latest".to_string(),
        candidates: Vec::new(),
      });
  }
  Err(ConstraintError::DistTagNotFound {
    name: info.name.clone(),
    dist_tag: tag.to_string(),
  })
}
