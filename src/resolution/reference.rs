// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::BTreeMap;
use std::path::PathBuf;

use deno_semver::Version;

use crate::registry::RegistryKind;
use crate::registry::RemoteDescriptor;

/// Index into the resolver's manifest arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManifestIdx(pub usize);

/// Index into the resolver's reference arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceIdx(pub usize);

/// Whether a package may be skipped on failure. Monotonic toward
/// required: once any requester needs it, it stays needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Optionality {
  #[default]
  Uninit,
  Optional,
  Required,
}

impl Optionality {
  pub fn join(self, other: Optionality) -> Optionality {
    use Optionality::*;
    match (self, other) {
      (Required, _) | (_, Required) => Required,
      (Optional, _) | (_, Optional) => Optional,
      (Uninit, Uninit) => Uninit,
    }
  }

  pub fn is_required(self) -> bool {
    matches!(self, Optionality::Required)
  }
}

/// One requester of a reference, with its depth from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
  pub pattern: String,
  pub level: usize,
}

/// The resolver-owned identity of one concrete resolved package.
/// Created the first time a unique `(name, version, remote)` is
/// discovered; mutated as new requesters attach; owned by the resolver
/// for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct PackageReference {
  pub name: String,
  pub version: Version,
  /// Stable identifier: equals `version` unless a non-registry source
  /// forces uniqueness.
  pub uid: String,
  pub registry: RegistryKind,
  pub remote: RemoteDescriptor,
  /// Every request pattern that resolved to this reference.
  pub patterns: Vec<String>,
  pub requests: Vec<RequestInfo>,
  /// Minimum observed depth from any root; drives hoisting decisions.
  pub level: usize,
  pub optionality: Optionality,
  pub ignore: bool,
  pub incompatible: bool,
  /// Newly added this run (absent from or stale in the lockfile).
  pub fresh: bool,
  pub permissions: BTreeMap<String, bool>,
  pub locations: Vec<PathBuf>,
  /// Dependency patterns issued on this reference's behalf.
  pub dependencies: Vec<String>,
  pub manifest: ManifestIdx,
}

impl PackageReference {
  pub fn new(
    name: String,
    version: Version,
    remote: RemoteDescriptor,
    manifest: ManifestIdx,
    fresh: bool,
  ) -> Self {
    Self {
      uid: remote.uid_for(&version),
      registry: remote.registry,
      name,
      version,
      remote,
      patterns: Vec::new(),
      requests: Vec::new(),
      level: usize::MAX,
      optionality: Optionality::Uninit,
      ignore: false,
      incompatible: false,
      fresh,
      permissions: BTreeMap::new(),
      locations: Vec::new(),
      dependencies: Vec::new(),
      manifest,
    }
  }

  /// Records a requester and folds its depth into `level`.
  pub fn add_request(&mut self, pattern: &str, level: usize) {
    self.level = self.level.min(level);
    self.requests.push(RequestInfo {
      pattern: pattern.to_string(),
      level,
    });
  }

  pub fn add_pattern(&mut self, pattern: &str) {
    if !self.patterns.iter().any(|p| p == pattern) {
      self.patterns.push(pattern.to_string());
    }
  }

  pub fn remove_pattern(&mut self, pattern: &str) {
    self.patterns.retain(|p| p != pattern);
  }

  pub fn add_optional(&mut self, optional: bool) {
    self.optionality = self.optionality.join(if optional {
      Optionality::Optional
    } else {
      Optionality::Required
    });
  }

  pub fn add_dependencies(&mut self, patterns: impl IntoIterator<Item = String>) {
    self.dependencies.extend(patterns);
  }

  pub fn add_location(&mut self, location: PathBuf) {
    if !self.locations.contains(&location) {
      self.locations.push(location);
    }
  }

  pub fn set_permission(&mut self, key: &str, value: bool) {
    self.permissions.insert(key.to_string(), value);
  }

  pub fn has_permission(&self, key: &str) -> bool {
    self.permissions.get(key).copied().unwrap_or(false)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn optionality_join_is_monotonic() {
    use Optionality::*;
    assert_eq!(Uninit.join(Optional), Optional);
    assert_eq!(Uninit.join(Required), Required);
    assert_eq!(Optional.join(Optional), Optional);
    assert_eq!(Optional.join(Required), Required);
    assert_eq!(Required.join(Optional), Required);
    assert_eq!(Required.join(Uninit), Required);
    assert_eq!(Uninit.join(Uninit), Uninit);
  }

  fn reference() -> PackageReference {
    PackageReference::new(
      "a".to_string(),
      Version::parse_from_npm("1.0.0").unwrap(),
      RemoteDescriptor::registry("https://r/a-1.0.0.tgz".to_string(), None),
      ManifestIdx(0),
      true,
    )
  }

  #[test]
  fn add_request_tracks_minimum_level() {
    let mut reference = reference();
    reference.add_request("a@^1.0.0", 3);
    assert_eq!(reference.level, 3);
    reference.add_request("a@~1.0.0", 1);
    assert_eq!(reference.level, 1);
    reference.add_request("a@1.x", 5);
    assert_eq!(reference.level, 1);
    assert_eq!(reference.requests.len(), 3);
  }

  #[test]
  fn optional_flag_latches_required() {
    let mut reference = reference();
    reference.add_optional(true);
    assert!(!reference.optionality.is_required());
    reference.add_optional(false);
    assert!(reference.optionality.is_required());
    reference.add_optional(true);
    assert!(reference.optionality.is_required());
  }

  #[test]
  fn patterns_and_permissions() {
    let mut reference = reference();
    reference.add_pattern("a@^1.0.0");
    reference.add_pattern("a@^1.0.0");
    assert_eq!(reference.patterns, vec!["a@^1.0.0"]);
    reference.remove_pattern("a@^1.0.0");
    assert!(reference.patterns.is_empty());

    assert!(!reference.has_permission("scripts"));
    reference.set_permission("scripts", true);
    assert!(reference.has_permission("scripts"));
  }
}
