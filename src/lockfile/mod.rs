// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use deno_semver::VersionReq;
use thiserror::Error;

use crate::normalize_pattern;
use crate::registry::RegistryKind;

mod parse;

pub use parse::LockValue;
pub use parse::LockfileParseError;
pub use parse::ParseKind;
pub use parse::ParsedLockfile;

pub const LOCKFILE_FILENAME: &str = "gantry.lock";

const LOCKFILE_HEADER: &str =
  "# This file is generated by gantry.\n# lockfile v1\n";

/// A per-pattern record capturing the exact version and remote chosen
/// in a prior run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LockfileEntry {
  /// Present only when the resolved name differs from the pattern
  /// names (aliases).
  pub name: Option<String>,
  pub version: String,
  pub resolved: Option<String>,
  pub integrity: Option<String>,
  pub registry: Option<RegistryKind>,
  /// Present only when it differs from `version`.
  pub uid: Option<String>,
  pub dependencies: BTreeMap<String, String>,
  pub optional_dependencies: BTreeMap<String, String>,
  pub permissions: BTreeMap<String, bool>,
  pub prebuilt_variants: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
enum LockedValue {
  Entry(LockfileEntry),
  /// Points at another pattern's entry.
  Alias(String),
}

#[derive(Debug, Error)]
pub enum LockfileError {
  #[error("Failed reading lockfile at {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error(transparent)]
  Parse(#[from] LockfileParseError),
}

/// The lockfile cache: per-pattern lookup over a parsed `gantry.lock`.
/// An absent file yields an empty cache.
#[derive(Debug, Default)]
pub struct Lockfile {
  entries: HashMap<String, LockedValue>,
  parse_kind: Option<ParseKind>,
}

impl Lockfile {
  pub async fn from_directory(dir: &Path) -> Result<Self, LockfileError> {
    let path = dir.join(LOCKFILE_FILENAME);
    match tokio::fs::read_to_string(&path).await {
      Ok(text) => Ok(Self::from_text(&text)?),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        Ok(Self::default())
      }
      Err(err) => Err(LockfileError::Io {
        path: path.display().to_string(),
        source: err,
      }),
    }
  }

  pub fn from_text(text: &str) -> Result<Self, LockfileParseError> {
    let parsed = parse::parse_lockfile(text)?;
    let mut entries = HashMap::with_capacity(parsed.object.len());
    for (pattern, value) in parsed.object {
      match value {
        LockValue::Str(target) => {
          entries.insert(pattern, LockedValue::Alias(target));
        }
        LockValue::Map(_) => {
          entries
            .insert(pattern, LockedValue::Entry(entry_from_value(&value)));
        }
        LockValue::Bool(_) => {}
      }
    }
    Ok(Self {
      entries,
      parse_kind: Some(parsed.kind),
    })
  }

  /// How the source text parsed, or `None` when no lockfile existed.
  pub fn parse_kind(&self) -> Option<ParseKind> {
    self.parse_kind
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Pattern-exact lookup. String values are followed as symlinks to
  /// another pattern's entry.
  pub fn get_locked(&self, pattern: &str) -> Option<&LockfileEntry> {
    let mut key = pattern;
    // alias chains are written one level deep, but tolerate a few hops
    for _ in 0..5 {
      match self.entries.get(key)? {
        LockedValue::Entry(entry) => return Some(entry),
        LockedValue::Alias(target) => key = target,
      }
    }
    None
  }

  pub fn remove_pattern(&mut self, pattern: &str) {
    self.entries.remove(pattern);
  }

  /// Detects legacy lockfiles needing checksum migration: any entry
  /// without an integrity string, excluding file and http sources
  /// which never carry one.
  pub fn has_entries_without_integrity(&self) -> bool {
    self.entries.iter().any(|(pattern, value)| match value {
      LockedValue::Entry(entry) => {
        let range = normalize_pattern(pattern).range;
        !range.starts_with("file:")
          && !range.starts_with("http")
          && entry.resolved.is_some()
          && entry.integrity.is_none()
      }
      LockedValue::Alias(_) => false,
    })
  }

  /// Serializes the final `{pattern → entry}` map produced at the end
  /// of resolution into lockfile text. Patterns are sorted; entries
  /// sharing a remote key are deduplicated so the first pattern in
  /// sort order owns the content and later patterns point to it.
  pub fn stringify_entries(
    patterns: &BTreeMap<String, LockfileEntry>,
  ) -> String {
    let mut object = BTreeMap::new();
    let mut owners_by_remote_key: HashMap<&str, &str> = HashMap::new();
    for (pattern, entry) in patterns {
      if let Some(resolved) = &entry.resolved {
        match owners_by_remote_key.get(resolved.as_str()) {
          Some(&owner) if patterns[owner] != *entry => {
            // same remote, different entry object: point at the owner
            object.insert(pattern.clone(), LockValue::Str(owner.to_string()));
            continue;
          }
          Some(_) => {}
          None => {
            owners_by_remote_key.insert(resolved.as_str(), pattern.as_str());
          }
        }
      }
      object.insert(pattern.clone(), entry_to_value(entry));
    }
    stringify_object(&object)
  }
}

fn entry_from_value(value: &LockValue) -> LockfileEntry {
  fn get_str(value: &LockValue, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
  }

  fn get_str_map(value: &LockValue, key: &str) -> BTreeMap<String, String> {
    match value.get(key) {
      Some(LockValue::Map(entries)) => entries
        .iter()
        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
        .collect(),
      _ => BTreeMap::new(),
    }
  }

  let permissions = match value.get("permissions") {
    Some(LockValue::Map(entries)) => entries
      .iter()
      .filter_map(|(k, v)| match v {
        LockValue::Bool(flag) => Some((k.clone(), *flag)),
        _ => None,
      })
      .collect(),
    _ => BTreeMap::new(),
  };

  LockfileEntry {
    name: get_str(value, "name"),
    version: get_str(value, "version").unwrap_or_default(),
    resolved: get_str(value, "resolved"),
    integrity: get_str(value, "integrity"),
    registry: get_str(value, "registry").and_then(|s| s.parse().ok()),
    uid: get_str(value, "uid"),
    dependencies: get_str_map(value, "dependencies"),
    optional_dependencies: get_str_map(value, "optionalDependencies"),
    permissions,
    prebuilt_variants: get_str_map(value, "prebuiltVariants"),
  }
}

fn entry_to_value(entry: &LockfileEntry) -> LockValue {
  fn str_map_value(map: &BTreeMap<String, String>) -> LockValue {
    LockValue::Map(
      map
        .iter()
        .map(|(k, v)| (k.clone(), LockValue::Str(v.clone())))
        .collect(),
    )
  }

  let mut fields = Vec::new();
  if let Some(name) = &entry.name {
    fields.push(("name".to_string(), LockValue::Str(name.clone())));
  }
  fields.push((
    "version".to_string(),
    LockValue::Str(entry.version.clone()),
  ));
  if let Some(uid) = &entry.uid {
    fields.push(("uid".to_string(), LockValue::Str(uid.clone())));
  }
  if let Some(resolved) = &entry.resolved {
    fields.push(("resolved".to_string(), LockValue::Str(resolved.clone())));
  }
  if let Some(integrity) = &entry.integrity {
    fields.push((
      "integrity".to_string(),
      LockValue::Str(canonicalize_integrity(integrity)),
    ));
  }
  if let Some(registry) = &entry.registry {
    fields.push((
      "registry".to_string(),
      LockValue::Str(registry.to_string()),
    ));
  }
  if !entry.dependencies.is_empty() {
    fields.push((
      "dependencies".to_string(),
      str_map_value(&entry.dependencies),
    ));
  }
  if !entry.optional_dependencies.is_empty() {
    fields.push((
      "optionalDependencies".to_string(),
      str_map_value(&entry.optional_dependencies),
    ));
  }
  if !entry.permissions.is_empty() {
    fields.push((
      "permissions".to_string(),
      LockValue::Map(
        entry
          .permissions
          .iter()
          .map(|(k, v)| (k.clone(), LockValue::Bool(*v)))
          .collect(),
      ),
    ));
  }
  if !entry.prebuilt_variants.is_empty() {
    fields.push((
      "prebuiltVariants".to_string(),
      str_map_value(&entry.prebuilt_variants),
    ));
  }
  LockValue::Map(fields)
}

/// Tokenizes an integrity string on whitespace and re-sorts so equal
/// multisets of algorithm-hash tokens serialize byte-identically.
fn canonicalize_integrity(integrity: &str) -> String {
  let mut tokens: Vec<&str> = integrity.split_whitespace().collect();
  tokens.sort_unstable();
  tokens.join(" ")
}

/// Serializes a parsed-form object. Top-level keys are sorted; keys
/// with equal values are comma-joined into one block at the position
/// of the first key.
pub fn stringify_object(object: &BTreeMap<String, LockValue>) -> String {
  let mut out = String::from(LOCKFILE_HEADER);
  let keys: Vec<&String> = object.keys().collect();
  let mut consumed = vec![false; keys.len()];
  for (index, key) in keys.iter().enumerate() {
    if consumed[index] {
      continue;
    }
    let value = &object[*key];
    out.push('\n');
    match value {
      LockValue::Map(_) => {
        let mut group = vec![maybe_wrap(key)];
        for (other_index, other_key) in
          keys.iter().enumerate().skip(index + 1)
        {
          if !consumed[other_index] && object[*other_key] == *value {
            consumed[other_index] = true;
            group.push(maybe_wrap(other_key));
          }
        }
        out.push_str(&group.join(", "));
        out.push_str(":\n");
        write_map_body(&mut out, value, 1);
      }
      scalar => {
        out.push_str(&maybe_wrap(key));
        out.push(' ');
        write_scalar(&mut out, scalar);
        out.push('\n');
      }
    }
  }
  out
}

fn write_map_body(out: &mut String, value: &LockValue, indent: usize) {
  let LockValue::Map(entries) = value else {
    return;
  };
  for (key, value) in entries {
    for _ in 0..indent {
      out.push_str("  ");
    }
    out.push_str(&maybe_wrap(key));
    match value {
      LockValue::Map(_) => {
        out.push_str(":\n");
        write_map_body(out, value, indent + 1);
      }
      scalar => {
        out.push(' ');
        write_scalar(out, scalar);
        out.push('\n');
      }
    }
  }
}

fn write_scalar(out: &mut String, value: &LockValue) {
  match value {
    LockValue::Str(text) => out.push_str(&maybe_wrap(text)),
    LockValue::Bool(flag) => {
      out.push_str(if *flag { "true" } else { "false" })
    }
    LockValue::Map(_) => unreachable!(),
  }
}

/// Tokens stay bare when they start with a letter and contain nothing
/// the parser treats specially; everything else is JSON-quoted.
fn maybe_wrap(text: &str) -> String {
  let simple = text
    .chars()
    .next()
    .map(|c| c.is_ascii_alphabetic())
    .unwrap_or(false)
    && !text.contains([' ', '\t', ':', ',', '"', '\n', '\\'])
    && text != "true"
    && text != "false";
  if simple {
    text.to_string()
  } else {
    serde_json::to_string(text).unwrap()
  }
}

/// An entry is stale when its pattern carries a valid, non-exotic
/// range with an explicit version and the recorded version no longer
/// satisfies it. A stale entry must be dropped and re-resolved.
pub fn is_entry_stale(
  entry: &LockfileEntry,
  pattern: &str,
  loose_semver: bool,
) -> bool {
  let parts = normalize_pattern(pattern);
  if !parts.has_version || crate::is_exotic_range(parts.range) {
    return false;
  }
  let Ok(req) = VersionReq::parse_from_npm(parts.range) else {
    return false;
  };
  if req.tag().is_some() {
    return false;
  }
  let Some(version) =
    crate::resolution::common::parse_version(&entry.version, loose_semver)
  else {
    return false;
  };
  !req.matches(&version)
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  fn entry(version: &str, resolved: Option<&str>) -> LockfileEntry {
    LockfileEntry {
      version: version.to_string(),
      resolved: resolved.map(str::to_string),
      ..Default::default()
    }
  }

  #[test]
  fn get_locked_follows_aliases() {
    let lockfile = Lockfile::from_text(
      r#"a@^1.0.0:
  version "1.1.0"

a@^1.1.0 "a@^1.0.0"
"#,
    )
    .unwrap();
    assert_eq!(lockfile.get_locked("a@^1.0.0").unwrap().version, "1.1.0");
    assert_eq!(lockfile.get_locked("a@^1.1.0").unwrap().version, "1.1.0");
    assert!(lockfile.get_locked("b@^1.0.0").is_none());
  }

  #[test]
  fn remove_pattern_drops_entry() {
    let mut lockfile = Lockfile::from_text("a@^1.0.0:\n  version \"1.0.0\"\n")
      .unwrap();
    assert!(lockfile.get_locked("a@^1.0.0").is_some());
    lockfile.remove_pattern("a@^1.0.0");
    assert!(lockfile.get_locked("a@^1.0.0").is_none());
  }

  #[test]
  fn detects_missing_integrity() {
    let lockfile = Lockfile::from_text(
      "a@^1.0.0:\n  version \"1.0.0\"\n  resolved \"https://r/a.tgz\"\n",
    )
    .unwrap();
    assert!(lockfile.has_entries_without_integrity());

    let lockfile = Lockfile::from_text(
      "a@^1.0.0:\n  version \"1.0.0\"\n  resolved \"https://r/a.tgz\"\n  integrity sha512-x\n",
    )
    .unwrap();
    assert!(!lockfile.has_entries_without_integrity());

    // file and http sources never carry integrity
    let lockfile = Lockfile::from_text(
      "\"a@file:../a\":\n  version \"1.0.0\"\n  resolved \"file:../a\"\n",
    )
    .unwrap();
    assert!(!lockfile.has_entries_without_integrity());
  }

  #[test]
  fn staleness_detection() {
    // satisfying version is not stale
    assert!(!is_entry_stale(&entry("1.0.0", None), "a@^1.0.0", false));
    // non-satisfying version is stale
    assert!(is_entry_stale(&entry("1.1.0", None), "a@^1.2.0", false));
    // exotic ranges and tags are never stale
    assert!(!is_entry_stale(&entry("1.1.0", None), "a@file:../a", false));
    assert!(!is_entry_stale(&entry("0.1.0", None), "a@latest", false));
    // no explicit version, never stale
    assert!(!is_entry_stale(&entry("0.1.0", None), "a", false));
    // unparseable recorded version, never stale
    assert!(!is_entry_stale(&entry("not-a-version", None), "a@^1.0.0", false));
    // loose mode tolerates lenient version forms
    assert!(!is_entry_stale(&entry("v1.2.0", None), "a@^1.0.0", true));
  }

  #[test]
  fn stringify_sorts_and_groups() {
    let mut patterns = BTreeMap::new();
    let shared = LockfileEntry {
      version: "1.1.0".to_string(),
      resolved: Some("https://r/a-1.1.0.tgz#abc".to_string()),
      integrity: Some("sha512-x".to_string()),
      ..Default::default()
    };
    patterns.insert("a@^1.1.0".to_string(), shared.clone());
    patterns.insert("a@^1.0.0".to_string(), shared);
    patterns.insert(
      "b@^2.0.0".to_string(),
      LockfileEntry {
        version: "2.0.0".to_string(),
        ..Default::default()
      },
    );
    let text = Lockfile::stringify_entries(&patterns);
    assert_eq!(
      text,
      r#"# This file is generated by gantry.
# lockfile v1

a@^1.0.0, a@^1.1.0:
  version "1.1.0"
  resolved "https://r/a-1.1.0.tgz#abc"
  integrity sha512-x

b@^2.0.0:
  version "2.0.0"
"#
    );
  }

  #[test]
  fn stringify_aliases_same_remote_different_entries() {
    let mut patterns = BTreeMap::new();
    patterns.insert(
      "a@^1.0.0".to_string(),
      LockfileEntry {
        version: "1.1.0".to_string(),
        resolved: Some("https://r/a-1.1.0.tgz#abc".to_string()),
        dependencies: BTreeMap::from([(
          "b".to_string(),
          "^2.0.0".to_string(),
        )]),
        ..Default::default()
      },
    );
    patterns.insert(
      "a@^1.1.0".to_string(),
      LockfileEntry {
        version: "1.1.0".to_string(),
        resolved: Some("https://r/a-1.1.0.tgz#abc".to_string()),
        ..Default::default()
      },
    );
    let text = Lockfile::stringify_entries(&patterns);
    assert!(text.contains("a@^1.1.0 \"a@^1.0.0\""));
  }

  #[test]
  fn integrity_canonicalization_is_byte_stable() {
    assert_eq!(
      canonicalize_integrity("sha512-zzz sha1-aaa"),
      canonicalize_integrity("sha1-aaa  sha512-zzz"),
    );
    assert_eq!(canonicalize_integrity("sha1-aaa sha512-zzz"), "sha1-aaa sha512-zzz");
  }

  #[test]
  fn serialization_is_idempotent() {
    let mut patterns = BTreeMap::new();
    patterns.insert(
      "@scope/a@^1.0.0".to_string(),
      LockfileEntry {
        version: "1.0.0".to_string(),
        resolved: Some("https://r/@scope/a-1.0.0.tgz#ff".to_string()),
        integrity: Some("sha512-b sha1-a".to_string()),
        dependencies: BTreeMap::from([("b".to_string(), "~2.0.0".to_string())]),
        permissions: BTreeMap::from([("scripts".to_string(), true)]),
        ..Default::default()
      },
    );
    patterns.insert(
      "b@~2.0.0".to_string(),
      LockfileEntry {
        version: "2.0.1".to_string(),
        resolved: Some("https://r/b-2.0.1.tgz#ee".to_string()),
        uid: Some("2.0.1-custom".to_string()),
        registry: Some(RegistryKind::Npm),
        ..Default::default()
      },
    );
    let first = Lockfile::stringify_entries(&patterns);
    let parsed = parse::parse_lockfile(&first).unwrap();
    assert_eq!(parsed.kind, ParseKind::Success);
    let second = stringify_object(&parsed.object);
    assert_eq!(first, second);
    // trailing newline and header
    assert!(first.starts_with("# This file is generated by gantry.\n"));
    assert!(first.ends_with('\n'));
  }

  #[test]
  fn stringify_is_stable_under_input_permutation() {
    let entries = [
      ("c@^3.0.0", "3.0.0"),
      ("a@^1.0.0", "1.0.0"),
      ("b@^2.0.0", "2.0.0"),
    ];
    let forward: BTreeMap<String, LockfileEntry> = entries
      .iter()
      .map(|(p, v)| (p.to_string(), entry(v, None)))
      .collect();
    let reverse: BTreeMap<String, LockfileEntry> = entries
      .iter()
      .rev()
      .map(|(p, v)| (p.to_string(), entry(v, None)))
      .collect();
    assert_eq!(
      Lockfile::stringify_entries(&forward),
      Lockfile::stringify_entries(&reverse)
    );
  }

  #[tokio::test]
  async fn from_directory_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let lockfile = Lockfile::from_directory(dir.path()).await.unwrap();
    assert!(lockfile.is_empty());
    assert_eq!(lockfile.parse_kind(), None);
  }

  #[tokio::test]
  async fn from_directory_reads_lockfile() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
      dir.path().join(LOCKFILE_FILENAME),
      "a@^1.0.0:\n  version \"1.0.0\"\n",
    )
    .unwrap();
    let lockfile = Lockfile::from_directory(dir.path()).await.unwrap();
    assert_eq!(lockfile.get_locked("a@^1.0.0").unwrap().version, "1.0.0");
    assert_eq!(lockfile.parse_kind(), Some(ParseKind::Success));
  }
}
