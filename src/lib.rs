// Copyright 2024-2026 the Gantry authors. MIT license.

pub mod config;
pub mod error;
pub mod lockfile;
pub mod manifest;
pub mod mutex;
pub mod rcfile;
pub mod registry;
pub mod resolution;
pub mod system_info;
pub mod workspace;

pub use error::ResolveError;
pub use system_info::SystemInfo;

/// A dependency pattern (`name@range`) split into its parts.
///
/// The borrowed slices point into the pattern text, except for the
/// defaults substituted when the range is missing or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedPattern<'a> {
  pub name: &'a str,
  pub range: &'a str,
  /// Whether the source string carried an explicit range after the
  /// name separator.
  pub has_version: bool,
}

/// Splits a pattern on `@` while honoring a single leading scope marker.
///
/// A missing range defaults to `latest`; an empty range after the `@`
/// becomes `*`. Ranges may themselves contain `@` (npm-style aliases
/// such as `a@npm:b@^1`), so only the first separator after the scope
/// counts.
pub fn normalize_pattern(pattern: &str) -> NormalizedPattern<'_> {
  let search_start = if pattern.starts_with('@') { 1 } else { 0 };
  match pattern[search_start..].find('@') {
    Some(index) => {
      let index = search_start + index;
      let range = &pattern[index + 1..];
      NormalizedPattern {
        name: &pattern[..index],
        range: if range.is_empty() { "*" } else { range },
        has_version: true,
      }
    }
    None => NormalizedPattern {
      name: pattern,
      range: "latest",
      has_version: false,
    },
  }
}

/// Non-registry sources a range can point at. Anything that parses as
/// one of these bypasses the semver reducer entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExoticKind {
  File,
  Link,
  Http,
  Git,
  Workspace,
}

/// Classifies a range as exotic by inspecting its prefix, or returns
/// `None` for semver ranges and tags.
pub fn exotic_kind(range: &str) -> Option<ExoticKind> {
  if range.starts_with("file:")
    || range.starts_with("./")
    || range.starts_with("../")
    || range.starts_with('/')
  {
    Some(ExoticKind::File)
  } else if range.starts_with("link:") {
    Some(ExoticKind::Link)
  } else if range.starts_with("http://") || range.starts_with("https://") {
    Some(ExoticKind::Http)
  } else if range.starts_with("git://")
    || range.starts_with("git+ssh://")
    || range.starts_with("git+http://")
    || range.starts_with("git+https://")
    || range.starts_with("git+file://")
    || range.starts_with("github:")
  {
    Some(ExoticKind::Git)
  } else if range.starts_with("workspace:") {
    Some(ExoticKind::Workspace)
  } else {
    None
  }
}

pub fn is_exotic_range(range: &str) -> bool {
  exotic_kind(range).is_some()
}
