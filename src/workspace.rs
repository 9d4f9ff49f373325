// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use globset::GlobBuilder;
use globset::GlobSet;
use globset::GlobSetBuilder;
use log::warn;

use crate::config::Config;
use crate::error::ResolveError;
use crate::error::UserError;
use crate::manifest::Manifest;
use crate::normalize_pattern;
use crate::registry::RegistryKind;
use crate::resolution::common::range_satisfies;

/// One sibling project enumerated from the root manifest's
/// `workspaces` field.
#[derive(Debug, Clone)]
pub struct WorkspaceMember {
  pub loc: PathBuf,
  pub manifest: Manifest,
}

/// The discovered workspace: sibling projects exposed to the resolver
/// as an in-memory registry.
#[derive(Debug, Default)]
pub struct WorkspaceLayout {
  pub root: PathBuf,
  members: HashMap<String, WorkspaceMember>,
}

impl WorkspaceLayout {
  pub fn new(root: PathBuf, members: HashMap<String, WorkspaceMember>) -> Self {
    Self { root, members }
  }

  pub fn members(&self) -> impl Iterator<Item = (&str, &WorkspaceMember)> {
    self.members.iter().map(|(name, member)| (name.as_str(), member))
  }

  pub fn get_member(&self, name: &str) -> Option<&WorkspaceMember> {
    self.members.get(name)
  }

  /// Resolves a pattern against the workspace: the name must be a
  /// member and the member's version must satisfy the range. The
  /// `workspace:` range prefix targets siblings explicitly.
  pub fn get_manifest_by_pattern(
    &self,
    pattern: &str,
  ) -> Option<&WorkspaceMember> {
    let parts = normalize_pattern(pattern);
    let member = self.members.get(parts.name)?;
    let range = parts.range.strip_prefix("workspace:").unwrap_or(parts.range);
    let version = member.manifest.version.as_ref()?;
    if range_satisfies(range, version) {
      Some(member)
    } else {
      None
    }
  }
}

/// Walks upward from `initial` looking for a manifest with a
/// `workspaces` field whose globs cover the starting directory.
pub fn find_workspace_root(initial: &Path) -> Option<PathBuf> {
  for dir in initial.ancestors() {
    let Some((_, manifest)) = read_manifest_in(dir) else {
      continue;
    };
    let Some(workspaces) = &manifest.workspaces else {
      continue;
    };
    let rel = initial.strip_prefix(dir).expect("ancestor of initial");
    if rel.as_os_str().is_empty() {
      return Some(dir.to_path_buf());
    }
    if let Ok(set) = build_globset(workspaces.packages()) {
      if set.is_match(slash_path(rel)) {
        return Some(dir.to_path_buf());
      }
    }
  }
  None
}

/// Expands the root manifest's workspace globs into the member map.
/// Anything under a module folder is ignored at any depth; every
/// member must carry a unique name and a version.
pub fn resolve_workspaces(
  root: &Path,
  root_manifest: &Manifest,
  config: &Config,
) -> Result<HashMap<String, WorkspaceMember>, ResolveError> {
  let mut members: HashMap<String, WorkspaceMember> = HashMap::new();
  let Some(workspaces) = &root_manifest.workspaces else {
    return Ok(members);
  };
  let packages = workspaces.packages();
  if packages.is_empty() {
    return Ok(members);
  }
  if !config.workspaces_enabled {
    warn!("Workspaces are disabled; ignoring the workspaces field");
    return Ok(members);
  }
  if !root_manifest.private {
    return Err(
      UserError(
        "Workspaces can only be enabled in private projects; set \"private\": true in the root manifest.".to_string(),
      )
      .into(),
    );
  }
  if !workspaces.nohoist().is_empty() && !config.workspaces_nohoist_enabled {
    return Err(
      UserError(
        "The nohoist list requires the workspaces-nohoist feature to be enabled.".to_string(),
      )
      .into(),
    );
  }

  let set = build_globset(packages).map_err(|err| {
    UserError(format!("Invalid workspaces glob: {err}"))
  })?;
  let module_folders = [
    RegistryKind::Gantry.module_folder(),
    RegistryKind::Npm.module_folder(),
  ];

  let walker = walkdir::WalkDir::new(root).into_iter().filter_entry(|e| {
    !(e.file_type().is_dir()
      && e
        .file_name()
        .to_str()
        .is_some_and(|name| module_folders.contains(&name)))
  });
  for entry in walker {
    let Ok(entry) = entry else { continue };
    if !entry.file_type().is_file() {
      continue;
    }
    let file_name = entry.file_name().to_string_lossy();
    if file_name != RegistryKind::Gantry.manifest_filename()
      && file_name != RegistryKind::Npm.manifest_filename()
    {
      continue;
    }
    let dir = entry.path().parent().expect("file has a parent");
    let Ok(rel_dir) = dir.strip_prefix(root) else {
      continue;
    };
    if rel_dir.as_os_str().is_empty() {
      // the root manifest itself
      continue;
    }
    if !set.is_match(slash_path(rel_dir)) {
      continue;
    }
    // when both manifest formats are present, the native one wins
    if file_name == RegistryKind::Npm.manifest_filename()
      && dir
        .join(RegistryKind::Gantry.manifest_filename())
        .exists()
    {
      continue;
    }

    let text = std::fs::read_to_string(entry.path()).map_err(|err| {
      UserError(format!(
        "Failed reading workspace manifest at {}: {err}",
        entry.path().display()
      ))
    })?;
    let manifest: Manifest = serde_json::from_str(&text).map_err(|err| {
      UserError(format!(
        "Failed parsing workspace manifest at {}: {err}",
        entry.path().display()
      ))
    })?;
    let (Some(name), Some(_)) = (&manifest.name, &manifest.version) else {
      return Err(
        UserError(format!(
          "Workspace at {} must declare both a name and a version",
          slash_path(rel_dir)
        ))
        .into(),
      );
    };
    if members.contains_key(name) {
      return Err(
        UserError(format!(
          "Two workspaces cannot share the name \"{name}\""
        ))
        .into(),
      );
    }
    members.insert(
      name.clone(),
      WorkspaceMember {
        loc: dir.to_path_buf(),
        manifest,
      },
    );
  }
  Ok(members)
}

/// Focus mode installs remote copies of a single workspace's siblings,
/// which is meaningless at the root itself.
pub fn check_focus(config: &Config, workspace_root: &Path) -> Result<(), UserError> {
  if config.focus && config.cwd == workspace_root {
    return Err(UserError(
      "Focus can only be used inside a workspace package, not at the workspace root.".to_string(),
    ));
  }
  Ok(())
}

fn read_manifest_in(dir: &Path) -> Option<(PathBuf, Manifest)> {
  for kind in [RegistryKind::Gantry, RegistryKind::Npm] {
    let path = dir.join(kind.manifest_filename());
    if let Ok(text) = std::fs::read_to_string(&path) {
      if let Ok(manifest) = serde_json::from_str::<Manifest>(&text) {
        return Some((path, manifest));
      }
    }
  }
  None
}

fn build_globset(globs: &[String]) -> Result<GlobSet, globset::Error> {
  let mut builder = GlobSetBuilder::new();
  for glob in globs {
    builder.add(
      GlobBuilder::new(glob)
        .literal_separator(true)
        .build()?,
    );
  }
  builder.build()
}

fn slash_path(path: &Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

#[cfg(test)]
mod test {
  use deno_semver::Version;
  use pretty_assertions::assert_eq;

  use super::*;

  fn write_manifest(dir: &Path, contents: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("gantry.json"), contents).unwrap();
  }

  fn workspace_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
      dir.path(),
      r#"{
        "name": "root",
        "version": "1.0.0",
        "private": true,
        "workspaces": ["packages/*"]
      }"#,
    );
    write_manifest(
      &dir.path().join("packages/w1"),
      r#"{"name": "w1", "version": "1.0.0"}"#,
    );
    write_manifest(
      &dir.path().join("packages/w2"),
      r#"{"name": "w2", "version": "2.1.0", "dependencies": {"w1": "^1.0.0"}}"#,
    );
    dir
  }

  fn root_manifest(dir: &Path) -> Manifest {
    serde_json::from_str(
      &std::fs::read_to_string(dir.join("gantry.json")).unwrap(),
    )
    .unwrap()
  }

  #[test]
  fn finds_workspace_root_from_member() {
    let dir = workspace_fixture();
    let root = dir.path().canonicalize().unwrap();
    let found =
      find_workspace_root(&root.join("packages/w1")).unwrap();
    assert_eq!(found, root);
    let found = find_workspace_root(&root).unwrap();
    assert_eq!(found, root);
  }

  #[test]
  fn resolves_members() {
    let dir = workspace_fixture();
    let config = Config::new(dir.path().to_path_buf());
    let members =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(
      members["w2"].manifest.version,
      Some(Version::parse_from_npm("2.1.0").unwrap())
    );
  }

  #[test]
  fn skips_module_folders() {
    let dir = workspace_fixture();
    write_manifest(
      &dir.path().join("packages/w1/gantry_modules/dep"),
      r#"{"name": "dep", "version": "0.0.1"}"#,
    );
    let config = Config::new(dir.path().to_path_buf());
    let members =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap();
    assert!(!members.contains_key("dep"));
  }

  #[test]
  fn rejects_duplicate_names() {
    let dir = workspace_fixture();
    write_manifest(
      &dir.path().join("packages/w3"),
      r#"{"name": "w1", "version": "3.0.0"}"#,
    );
    let config = Config::new(dir.path().to_path_buf());
    let err =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap_err();
    assert!(err.to_string().contains("cannot share the name"));
  }

  #[test]
  fn requires_private_root() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
      dir.path(),
      r#"{"name": "root", "version": "1.0.0", "workspaces": ["packages/*"]}"#,
    );
    let config = Config::new(dir.path().to_path_buf());
    let err =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap_err();
    assert!(err.to_string().contains("private"));
  }

  #[test]
  fn nohoist_requires_feature() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
      dir.path(),
      r#"{
        "name": "root",
        "version": "1.0.0",
        "private": true,
        "workspaces": {"packages": ["packages/*"], "nohoist": ["**/c"]}
      }"#,
    );
    write_manifest(
      &dir.path().join("packages/w1"),
      r#"{"name": "w1", "version": "1.0.0"}"#,
    );
    let mut config = Config::new(dir.path().to_path_buf());
    let err =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap_err();
    assert!(err.to_string().contains("nohoist"));

    config.workspaces_nohoist_enabled = true;
    let members =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap();
    assert_eq!(members.len(), 1);
  }

  #[test]
  fn member_lookup_by_pattern() {
    let dir = workspace_fixture();
    let config = Config::new(dir.path().to_path_buf());
    let members =
      resolve_workspaces(dir.path(), &root_manifest(dir.path()), &config)
        .unwrap();
    let layout = WorkspaceLayout::new(dir.path().to_path_buf(), members);

    assert!(layout.get_manifest_by_pattern("w1@^1.0.0").is_some());
    assert!(layout.get_manifest_by_pattern("w1@^2.0.0").is_none());
    assert!(layout.get_manifest_by_pattern("w2@workspace:*").is_some());
    assert!(layout.get_manifest_by_pattern("unknown@^1.0.0").is_none());
  }

  #[test]
  fn focus_is_invalid_at_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(dir.path().to_path_buf());
    config.focus = true;
    assert!(check_focus(&config, dir.path()).is_err());
    assert!(check_focus(&config, &dir.path().join("other")).is_ok());
    config.focus = false;
    assert!(check_focus(&config, dir.path()).is_ok());
  }
}
