// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::HashMap;

use globset::GlobBuilder;
use globset::GlobMatcher;
use log::warn;

use crate::normalize_pattern;
use crate::resolution::request::PackageRequest;

/// One rule parsed from the root manifest's `resolutions` field.
///
/// Keys name a dependency, optionally qualified by its ancestry:
/// - `"c": "1.0.0"` pins `c` as a direct dependency;
/// - `"a/c": "1.0.0"` pins `c` only underneath the direct dependency `a`;
/// - `"**/c": "1.0.0"` pins every `c` at any depth.
#[derive(Debug)]
pub struct ResolutionEntry {
  /// The key as written.
  pub key: String,
  /// The dependency name the key targets (its last segment; a scope
  /// and bare name count as one segment).
  pub name: String,
  /// The pinned exact version or exotic reference.
  pub version: String,
  matcher: GlobMatcher,
}

impl ResolutionEntry {
  /// The pattern every matching request is rewritten to.
  pub fn resolved_pattern(&self) -> String {
    format!("{}@{}", self.name, self.version)
  }
}

/// User-supplied exact-version overrides keyed by ancestry path.
#[derive(Debug, Default)]
pub struct ResolutionMap {
  entries_by_name: HashMap<String, Vec<ResolutionEntry>>,
  /// Requests whose override pin was not yet in the patterns map when
  /// first checked; drained after the main find pass.
  pub delay_queue: Vec<PackageRequest>,
}

impl ResolutionMap {
  pub fn from_resolutions(resolutions: &HashMap<String, String>) -> Self {
    let mut map = Self::default();
    // insertion in sorted key order keeps lookups deterministic
    let mut keys: Vec<&String> = resolutions.keys().collect();
    keys.sort();
    for key in keys {
      let version = &resolutions[key];
      match parse_resolution_key(key) {
        Some((name, matcher)) => {
          map.entries_by_name.entry(name.clone()).or_default().push(
            ResolutionEntry {
              key: key.clone(),
              name,
              version: version.clone(),
              matcher,
            },
          );
        }
        None => {
          warn!("Ignoring invalid resolution key \"{key}\"");
        }
      }
    }
    map
  }

  pub fn is_empty(&self) -> bool {
    self.entries_by_name.is_empty()
  }

  /// Finds the rule applying to a request, if any: the requested name
  /// must match the key's last segment and the ancestry path from the
  /// root must match the key glob.
  pub fn find(
    &self,
    pattern: &str,
    parent_names: &[String],
  ) -> Option<&ResolutionEntry> {
    let name = normalize_pattern(pattern).name;
    let entries = self.entries_by_name.get(name)?;
    let mut path = String::new();
    for parent in parent_names {
      path.push_str(parent);
      path.push('/');
    }
    path.push_str(name);
    entries.iter().find(|entry| entry.matcher.is_match(&path))
  }
}

/// Splits a resolution key into the targeted name and the glob over
/// the full ancestry path. Returns `None` for unbuildable globs.
fn parse_resolution_key(key: &str) -> Option<(String, GlobMatcher)> {
  let segments: Vec<&str> = key.split('/').collect();
  let name = match segments.as_slice() {
    [] | [""] => return None,
    [.., scope, bare] if scope.starts_with('@') => format!("{scope}/{bare}"),
    [.., bare] => {
      if bare.is_empty() {
        return None;
      }
      bare.to_string()
    }
  };
  let matcher = GlobBuilder::new(key)
    .literal_separator(true)
    .build()
    .ok()?
    .compile_matcher();
  Some((name, matcher))
}
