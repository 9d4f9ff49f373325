// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use deno_semver::Version;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::manifest::lenient;
use crate::manifest::Manifest;
use crate::ExoticKind;

/// The backends that can own a resolved package. Each one reads a
/// different manifest file format; the concrete network clients live
/// outside this crate.
#[derive(
  Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
  #[default]
  Gantry,
  Npm,
}

impl RegistryKind {
  /// The manifest file name this backend reads.
  pub fn manifest_filename(&self) -> &'static str {
    match self {
      RegistryKind::Gantry => "gantry.json",
      RegistryKind::Npm => "package.json",
    }
  }

  /// The module folder this backend installs into. Workspace discovery
  /// skips anything beneath one of these at any depth.
  pub fn module_folder(&self) -> &'static str {
    match self {
      RegistryKind::Gantry => "gantry_modules",
      RegistryKind::Npm => "node_modules",
    }
  }

  /// Prefix used when hydrating backend settings from the environment.
  pub fn env_prefix(&self) -> &'static str {
    match self {
      RegistryKind::Gantry => "gantry_",
      RegistryKind::Npm => "npm_",
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      RegistryKind::Gantry => "gantry",
      RegistryKind::Npm => "npm",
    }
  }
}

impl std::fmt::Display for RegistryKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for RegistryKind {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "gantry" => Ok(RegistryKind::Gantry),
      "npm" => Ok(RegistryKind::Npm),
      _ => Err(()),
    }
  }
}

/// Gets the name and raw version constraint for a dependency entry
/// taking into account npm-style package aliases.
pub fn parse_dep_entry_name_and_raw_version<'a>(
  key: &'a str,
  value: &'a str,
) -> (&'a str, &'a str) {
  if let Some(package_and_version) = value.strip_prefix("npm:") {
    if let Some((name, version)) = package_and_version.rsplit_once('@') {
      // if empty, then the name was scoped and there's no version
      if name.is_empty() {
        (package_and_version, "*")
      } else {
        (name, version)
      }
    } else {
      (package_and_version, "*")
    }
  } else {
    (key, value)
  }
}

/// The full registry document for one package name: every published
/// version plus the dist-tag map.
#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct PackageInfo {
  pub name: String,
  pub versions: HashMap<Version, VersionInfo>,
  #[serde(rename = "dist-tags")]
  pub dist_tags: HashMap<String, Version>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
  pub version: Version,
  pub dist: DistInfo,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub optional_dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub peer_dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::vector")]
  pub os: Vec<String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::vector")]
  pub cpu: Vec<String>,
}

impl VersionInfo {
  /// Builds the normalized manifest the resolver stores for a package
  /// resolved from registry metadata.
  pub fn to_manifest(&self, name: &str) -> Manifest {
    Manifest {
      name: Some(name.to_string()),
      version: Some(self.version.clone()),
      dependencies: self.dependencies.clone(),
      optional_dependencies: self.optional_dependencies.clone(),
      peer_dependencies: self.peer_dependencies.clone(),
      os: self.os.clone(),
      cpu: self.cpu.clone(),
      ..Default::default()
    }
  }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistInfo {
  /// URL to the archive.
  pub tarball: String,
  #[serde(default)]
  pub shasum: String,
  #[serde(default)]
  pub integrity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistIntegrity<'a> {
  /// `algorithm-<base64 hash>`, possibly several tokens.
  Integrity {
    algorithm: &'a str,
    base64_hash: &'a str,
  },
  /// The integrity could not be split on a dash.
  Unknown(&'a str),
  /// The legacy hex sha1 checksum.
  LegacySha1Hex(&'a str),
}

impl DistInfo {
  pub fn integrity(&self) -> DistIntegrity<'_> {
    match &self.integrity {
      Some(integrity) => match integrity.split_once('-') {
        Some((algorithm, base64_hash)) => DistIntegrity::Integrity {
          algorithm,
          base64_hash,
        },
        None => DistIntegrity::Unknown(integrity.as_str()),
      },
      None => DistIntegrity::LegacySha1Hex(&self.shasum),
    }
  }
}

/// How a resolved package can be materialized by the fetcher.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
  /// A registry-served archive.
  Registry,
  /// An arbitrary archive URL.
  Tarball,
  Git,
  File,
  Link,
  Workspace,
}

/// Opaque descriptor telling the fetcher how to retrieve a package.
/// The resolver only reads it for identity (`remote_key`) and lockfile
/// serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
  pub kind: RemoteKind,
  /// URL or path, without the hash fragment.
  pub reference: String,
  pub hash: Option<String>,
  pub integrity: Option<String>,
  pub registry: RegistryKind,
}

impl RemoteDescriptor {
  pub fn registry(reference: String, integrity: Option<String>) -> Self {
    Self {
      kind: RemoteKind::Registry,
      reference,
      hash: None,
      integrity,
      registry: RegistryKind::default(),
    }
  }

  /// The `resolved` form written to the lockfile: the reference with
  /// the hash appended as a fragment.
  pub fn resolved(&self) -> String {
    match &self.hash {
      Some(hash) => format!("{}#{}", self.reference, hash),
      None => self.reference.clone(),
    }
  }

  /// Identity key for deduplication: two remotes with the same key
  /// materialize the same bytes.
  pub fn remote_key(&self) -> String {
    self.resolved()
  }

  /// The stable identifier of a package behind this remote. Registry
  /// packages are identified by version alone; other sources append
  /// the remote hash so two checkouts of the same version stay
  /// distinct.
  pub fn uid_for(&self, version: &Version) -> String {
    match (&self.kind, &self.hash) {
      (RemoteKind::Registry, _) | (_, None) => version.to_string(),
      (_, Some(hash)) => format!("{version}-{hash}"),
    }
  }
}

/// A parsed exotic range, handed to the backend for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExoticSpecifier {
  pub kind: ExoticKind,
  /// The range text as written, prefix included.
  pub raw: String,
}

/// What an exotic resolver produces: the manifest found at the source
/// plus the remote describing how to fetch it again.
#[derive(Debug, Clone)]
pub struct ExoticPackageInfo {
  pub manifest: Manifest,
  pub remote: RemoteDescriptor,
}

/// Error that occurs when loading package metadata fails. Cloneable so
/// a memoized failure can be handed to every waiter.
#[derive(Debug, Error, Clone)]
pub enum RegistryPackageInfoLoadError {
  #[error("Package '{package_name}' does not exist.")]
  PackageNotExists { package_name: String },
  #[error("Request for '{package_name}' timed out.")]
  Timeout { package_name: String },
  #[error(transparent)]
  LoadError(#[from] Arc<anyhow::Error>),
}

/// The contract the resolver consumes. One instance serves both
/// registry metadata and exotic (non-registry) sources.
///
/// Implementers should coalesce concurrent requests for the same
/// package name rather than issuing duplicate remote calls.
#[async_trait(?Send)]
pub trait RegistryApi {
  async fn package_info(
    &self,
    name: &str,
  ) -> Result<Arc<PackageInfo>, RegistryPackageInfoLoadError>;

  async fn exotic_info(
    &self,
    specifier: &ExoticSpecifier,
  ) -> Result<ExoticPackageInfo, RegistryPackageInfoLoadError>;

  /// Marks that new requests should bypass any cache. Returns true
  /// only if the implementer has a cache and the flag was newly set.
  fn mark_force_reload(&self) -> bool {
    false
  }
}

/// A simple in-memory implementation of [`RegistryApi`] for testing.
/// Not behind `#[cfg(test)]` so downstream crates and benches can use
/// it too.
#[derive(Clone, Default, Debug)]
pub struct TestRegistryApi {
  package_infos: Arc<Mutex<HashMap<String, PackageInfo>>>,
  exotic_infos: Arc<Mutex<HashMap<String, ExoticPackageInfo>>>,
}

impl TestRegistryApi {
  pub fn add_package_info(&self, name: &str, info: PackageInfo) {
    let previous = self
      .package_infos
      .lock()
      .unwrap()
      .insert(name.to_string(), info);
    assert!(previous.is_none());
  }

  pub fn ensure_package(&self, name: &str) {
    if !self.package_infos.lock().unwrap().contains_key(name) {
      self.add_package_info(
        name,
        PackageInfo {
          name: name.to_string(),
          ..Default::default()
        },
      );
    }
  }

  pub fn with_package(&self, name: &str, f: impl FnOnce(&mut PackageInfo)) {
    self.ensure_package(name);
    let mut infos = self.package_infos.lock().unwrap();
    f(infos.get_mut(name).unwrap());
  }

  pub fn add_dist_tag(&self, package_name: &str, tag: &str, version: &str) {
    self.with_package(package_name, |package| {
      package
        .dist_tags
        .insert(tag.to_string(), Version::parse_from_npm(version).unwrap());
    })
  }

  pub fn ensure_package_version(&self, name: &str, version: &str) {
    self.ensure_package_version_with_integrity(name, version, None)
  }

  pub fn ensure_package_version_with_integrity(
    &self,
    name: &str,
    version: &str,
    integrity: Option<&str>,
  ) {
    self.ensure_package(name);
    let mut infos = self.package_infos.lock().unwrap();
    let info = infos.get_mut(name).unwrap();
    let version = Version::parse_from_npm(version).unwrap();
    if !info.versions.contains_key(&version) {
      info.versions.insert(
        version.clone(),
        VersionInfo {
          dist: DistInfo {
            tarball: format!(
              "https://registry.gantry.dev/{name}/-/{name}-{version}.tgz"
            ),
            integrity: integrity.map(|s| s.to_string()),
            ..Default::default()
          },
          version,
          ..Default::default()
        },
      );
    }
  }

  pub fn with_version_info(
    &self,
    package: (&str, &str),
    f: impl FnOnce(&mut VersionInfo),
  ) {
    let (name, version) = package;
    self.ensure_package_version(name, version);
    let mut infos = self.package_infos.lock().unwrap();
    let info = infos.get_mut(name).unwrap();
    let version = Version::parse_from_npm(version).unwrap();
    f(info.versions.get_mut(&version).unwrap());
  }

  pub fn add_dependency(&self, package: (&str, &str), entry: (&str, &str)) {
    self.with_version_info(package, |version| {
      version
        .dependencies
        .insert(entry.0.to_string(), entry.1.to_string());
    })
  }

  pub fn add_optional_dep(&self, package: (&str, &str), entry: (&str, &str)) {
    self.with_version_info(package, |version| {
      version
        .optional_dependencies
        .insert(entry.0.to_string(), entry.1.to_string());
    })
  }

  pub fn add_exotic_package(
    &self,
    raw_specifier: &str,
    info: ExoticPackageInfo,
  ) {
    self
      .exotic_infos
      .lock()
      .unwrap()
      .insert(raw_specifier.to_string(), info);
  }
}

#[async_trait(?Send)]
impl RegistryApi for TestRegistryApi {
  async fn package_info(
    &self,
    name: &str,
  ) -> Result<Arc<PackageInfo>, RegistryPackageInfoLoadError> {
    let infos = self.package_infos.lock().unwrap();
    match infos.get(name) {
      Some(info) => Ok(Arc::new(info.clone())),
      None => Err(RegistryPackageInfoLoadError::PackageNotExists {
        package_name: name.to_string(),
      }),
    }
  }

  async fn exotic_info(
    &self,
    specifier: &ExoticSpecifier,
  ) -> Result<ExoticPackageInfo, RegistryPackageInfoLoadError> {
    let infos = self.exotic_infos.lock().unwrap();
    match infos.get(&specifier.raw) {
      Some(info) => Ok(info.clone()),
      None => Err(RegistryPackageInfoLoadError::PackageNotExists {
        package_name: specifier.raw.clone(),
      }),
    }
  }
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn deserializes_minimal_version_info() {
    let text = r#"{ "version": "1.0.0", "dist": { "tarball": "value", "shasum": "test" } }"#;
    let info: VersionInfo = serde_json::from_str(text).unwrap();
    assert_eq!(
      info,
      VersionInfo {
        version: Version::parse_from_npm("1.0.0").unwrap(),
        dist: DistInfo {
          tarball: "value".to_string(),
          shasum: "test".to_string(),
          integrity: None,
        },
        ..Default::default()
      }
    );
  }

  #[test]
  fn deserializes_null_entries() {
    let text = r#"{
      "version": "1.0.0",
      "dist": { "tarball": "value" },
      "dependencies": null,
      "optionalDependencies": null,
      "peerDependencies": null,
      "os": null,
      "cpu": null
    }"#;
    let info: VersionInfo = serde_json::from_str(text).unwrap();
    assert!(info.dependencies.is_empty());
    assert!(info.optional_dependencies.is_empty());
    assert!(info.peer_dependencies.is_empty());
    assert!(info.os.is_empty());
    assert!(info.cpu.is_empty());
  }

  #[test]
  fn integrity_forms() {
    let text =
      r#"{ "tarball": "", "integrity": "sha512-testing", "shasum": "here" }"#;
    let info: DistInfo = serde_json::from_str(text).unwrap();
    assert_eq!(
      info.integrity(),
      DistIntegrity::Integrity {
        algorithm: "sha512",
        base64_hash: "testing"
      }
    );

    let text = r#"{ "tarball": "", "shasum": "here" }"#;
    let info: DistInfo = serde_json::from_str(text).unwrap();
    assert_eq!(info.integrity(), DistIntegrity::LegacySha1Hex("here"));

    let text = r#"{ "tarball": "", "integrity": "test", "shasum": "here" }"#;
    let info: DistInfo = serde_json::from_str(text).unwrap();
    assert_eq!(info.integrity(), DistIntegrity::Unknown("test"));
  }

  #[test]
  fn remote_uid_rules() {
    let version = Version::parse_from_npm("1.2.3").unwrap();
    let registry = RemoteDescriptor::registry("https://r/a.tgz".to_string(), None);
    assert_eq!(registry.uid_for(&version), "1.2.3");

    let git = RemoteDescriptor {
      kind: RemoteKind::Git,
      reference: "https://host/a.git".to_string(),
      hash: Some("abc123".to_string()),
      integrity: None,
      registry: RegistryKind::Gantry,
    };
    assert_eq!(git.uid_for(&version), "1.2.3-abc123");
    assert_eq!(git.resolved(), "https://host/a.git#abc123");
    // two exotic remotes with the same version but different hashes
    // stay distinct
    let other = RemoteDescriptor {
      hash: Some("def456".to_string()),
      ..git.clone()
    };
    assert_ne!(git.uid_for(&version), other.uid_for(&version));
    assert_ne!(git.remote_key(), other.remote_key());
  }

  #[test]
  fn parses_dep_entry_aliases() {
    let cases = [
      ("test", "^1.2", ("test", "^1.2")),
      ("test", "1.x - 2.6", ("test", "1.x - 2.6")),
      ("test", "npm:package@^1.2", ("package", "^1.2")),
      ("test", "npm:package", ("package", "*")),
      ("test", "npm:@scope/package", ("@scope/package", "*")),
      ("test", "npm:@scope/package@1", ("@scope/package", "1")),
    ];
    for (key, value, expected) in cases {
      assert_eq!(parse_dep_entry_name_and_raw_version(key, value), expected);
    }
  }
}
