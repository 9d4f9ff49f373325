// Copyright 2024-2026 the Gantry authors. MIT license.

//! One resolution unit: a `(pattern, parent chain, registry, optional)`
//! tuple. A request either attaches its pattern to a reference that
//! already exists (override pin, lockfile entry, previously discovered
//! version) or produces a fresh reference from registry or exotic
//! metadata. The resolver drives the lifecycle; this module owns the
//! request identity and the conversions requests need.

use std::collections::HashMap;

use crate::lockfile::LockfileEntry;
use crate::manifest::Manifest;
use crate::normalize_pattern;
use crate::registry::parse_dep_entry_name_and_raw_version;
use crate::registry::RegistryKind;
use crate::registry::RemoteDescriptor;
use crate::registry::RemoteKind;
use crate::resolution::common;
use crate::ExoticKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
  pub pattern: String,
  pub registry: RegistryKind,
  pub optional: bool,
  /// Names of the ancestors that led to this request, root first. Used
  /// by the resolution map and for depth tracking.
  pub parent_names: Vec<String>,
}

impl PackageRequest {
  pub fn root(pattern: String, registry: RegistryKind, optional: bool) -> Self {
    Self {
      pattern,
      registry,
      optional,
      parent_names: Vec::new(),
    }
  }

  pub fn level(&self) -> usize {
    self.parent_names.len()
  }

  /// The in-flight deduplication key. Distinct optionality resolves
  /// separately so a required requester can never be swallowed by an
  /// optional one.
  pub fn fetch_key(&self) -> String {
    format!("{}:{}:{}", self.registry.as_str(), self.pattern, self.optional)
  }

  /// The registry-facing name and range, with npm-style aliases
  /// (`dep@npm:real@^1`) unwrapped.
  pub fn registry_name_and_range(&self) -> (&str, &str) {
    let parts = normalize_pattern(&self.pattern);
    parse_dep_entry_name_and_raw_version(parts.name, parts.range)
  }
}

/// Builds the seed requests for a root manifest: all four dependency
/// maps, with dev dependencies included only outside production mode.
pub fn root_requests(
  manifest: &Manifest,
  registry: RegistryKind,
  production: bool,
) -> Vec<PackageRequest> {
  let mut requests = Vec::new();
  let mut push = |deps: &HashMap<String, String>, optional: bool| {
    let mut entries: Vec<(&String, &String)> = deps.iter().collect();
    entries.sort();
    for (name, range) in entries {
      requests.push(PackageRequest::root(
        format!("{name}@{range}"),
        registry,
        optional,
      ));
    }
  };
  push(&manifest.dependencies, false);
  if !production {
    push(&manifest.dev_dependencies, false);
  }
  push(&manifest.peer_dependencies, false);
  push(&manifest.optional_dependencies, true);
  requests
}

/// Expands a resolved manifest into its child requests. Children carry
/// the parent chain extended with this package's name and inherit
/// optionality from the requester: nothing underneath an optional
/// subtree may abort the run.
pub fn child_requests(
  request: &PackageRequest,
  manifest: &Manifest,
) -> Vec<PackageRequest> {
  let mut parent_names = request.parent_names.clone();
  parent_names.push(manifest.name_str().to_string());

  let mut requests = Vec::new();
  let mut push = |deps: &HashMap<String, String>, optional: bool| {
    let mut entries: Vec<(&String, &String)> = deps.iter().collect();
    entries.sort();
    for (name, range) in entries {
      requests.push(PackageRequest {
        pattern: format!("{name}@{range}"),
        registry: request.registry,
        optional: request.optional || optional,
        parent_names: parent_names.clone(),
      });
    }
  };
  push(&manifest.dependencies, false);
  push(&manifest.optional_dependencies, true);
  requests
}

/// Rehydrates a valid lockfile entry into the manifest and remote a
/// registry fetch would have produced. Returns `None` when the entry
/// is unusable (e.g. an unparseable version), in which case the caller
/// drops it and resolves afresh.
pub fn manifest_from_lockfile_entry(
  pattern: &str,
  entry: &LockfileEntry,
  request_registry: RegistryKind,
  loose_semver: bool,
) -> Option<(Manifest, RemoteDescriptor)> {
  let version = common::parse_version(&entry.version, loose_semver)?;
  let parts = normalize_pattern(pattern);
  let name = entry
    .name
    .clone()
    .unwrap_or_else(|| parts.name.to_string());

  let manifest = Manifest {
    name: Some(name),
    version: Some(version),
    dependencies: entry
      .dependencies
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect(),
    optional_dependencies: entry
      .optional_dependencies
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect(),
    ..Default::default()
  };

  let kind = match crate::exotic_kind(parts.range) {
    Some(ExoticKind::File) => RemoteKind::File,
    Some(ExoticKind::Link) => RemoteKind::Link,
    Some(ExoticKind::Http) => RemoteKind::Tarball,
    Some(ExoticKind::Git) => RemoteKind::Git,
    Some(ExoticKind::Workspace) => RemoteKind::Workspace,
    None => RemoteKind::Registry,
  };
  let (reference, hash) = match &entry.resolved {
    Some(resolved) => match resolved.rsplit_once('#') {
      Some((reference, hash)) => {
        (reference.to_string(), Some(hash.to_string()))
      }
      None => (resolved.clone(), None),
    },
    None => (String::new(), None),
  };
  let remote = RemoteDescriptor {
    kind,
    reference,
    hash,
    integrity: entry.integrity.clone(),
    registry: entry.registry.unwrap_or(request_registry),
  };
  Some((manifest, remote))
}

#[cfg(test)]
mod test {
  use std::collections::BTreeMap;

  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn fetch_key_distinguishes_optionality() {
    let required =
      PackageRequest::root("a@^1.0.0".to_string(), RegistryKind::Gantry, false);
    let optional =
      PackageRequest::root("a@^1.0.0".to_string(), RegistryKind::Gantry, true);
    assert_ne!(required.fetch_key(), optional.fetch_key());
    assert_eq!(required.fetch_key(), "gantry:a@^1.0.0:false");
  }

  #[test]
  fn alias_requests_unwrap() {
    let request = PackageRequest::root(
      "a@npm:b@^1.0.0".to_string(),
      RegistryKind::Gantry,
      false,
    );
    assert_eq!(request.registry_name_and_range(), ("b", "^1.0.0"));
  }

  #[test]
  fn root_requests_honor_production() {
    let manifest = Manifest {
      dependencies: HashMap::from([("a".to_string(), "^1.0.0".to_string())]),
      dev_dependencies: HashMap::from([(
        "d".to_string(),
        "^2.0.0".to_string(),
      )]),
      optional_dependencies: HashMap::from([(
        "o".to_string(),
        "^3.0.0".to_string(),
      )]),
      ..Default::default()
    };
    let all = root_requests(&manifest, RegistryKind::Gantry, false);
    assert_eq!(
      all.iter().map(|r| r.pattern.as_str()).collect::<Vec<_>>(),
      vec!["a@^1.0.0", "d@^2.0.0", "o@^3.0.0"]
    );
    assert!(all.iter().find(|r| r.pattern.starts_with("o@")).unwrap().optional);

    let production = root_requests(&manifest, RegistryKind::Gantry, true);
    assert!(!production.iter().any(|r| r.pattern.starts_with("d@")));
  }

  #[test]
  fn child_requests_extend_parent_chain() {
    let request = PackageRequest {
      pattern: "a@^1.0.0".to_string(),
      registry: RegistryKind::Gantry,
      optional: false,
      parent_names: vec!["root-dep".to_string()],
    };
    let manifest = Manifest {
      name: Some("a".to_string()),
      dependencies: HashMap::from([("b".to_string(), "^2.0.0".to_string())]),
      optional_dependencies: HashMap::from([(
        "c".to_string(),
        "^3.0.0".to_string(),
      )]),
      ..Default::default()
    };
    let children = child_requests(&request, &manifest);
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].parent_names, vec!["root-dep", "a"]);
    assert!(!children[0].optional);
    assert!(children[1].optional);
  }

  #[test]
  fn optional_subtree_stays_optional() {
    let request = PackageRequest {
      pattern: "a@^1.0.0".to_string(),
      registry: RegistryKind::Gantry,
      optional: true,
      parent_names: Vec::new(),
    };
    let manifest = Manifest {
      name: Some("a".to_string()),
      dependencies: HashMap::from([("b".to_string(), "^2.0.0".to_string())]),
      ..Default::default()
    };
    let children = child_requests(&request, &manifest);
    assert!(children[0].optional);
  }

  #[test]
  fn lockfile_entry_rehydrates() {
    let entry = LockfileEntry {
      version: "1.1.0".to_string(),
      resolved: Some("https://r/a-1.1.0.tgz#abc".to_string()),
      integrity: Some("sha512-x".to_string()),
      dependencies: BTreeMap::from([("b".to_string(), "^2.0.0".to_string())]),
      ..Default::default()
    };
    let (manifest, remote) = manifest_from_lockfile_entry(
      "a@^1.0.0",
      &entry,
      RegistryKind::Gantry,
      false,
    )
    .unwrap();
    assert_eq!(manifest.name.as_deref(), Some("a"));
    assert_eq!(manifest.version.as_ref().unwrap().to_string(), "1.1.0");
    assert_eq!(manifest.dependencies.len(), 1);
    assert_eq!(remote.kind, RemoteKind::Registry);
    assert_eq!(remote.reference, "https://r/a-1.1.0.tgz");
    assert_eq!(remote.hash.as_deref(), Some("abc"));
    // round-trips to the same resolved string
    assert_eq!(remote.resolved(), "https://r/a-1.1.0.tgz#abc");
  }

  #[test]
  fn unusable_lockfile_entry_is_rejected() {
    let entry = LockfileEntry {
      version: "not-a-version".to_string(),
      ..Default::default()
    };
    assert!(manifest_from_lockfile_entry(
      "a@^1.0.0",
      &entry,
      RegistryKind::Gantry,
      false
    )
    .is_none());
  }
}
