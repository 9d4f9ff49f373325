// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::HashMap;

use deno_semver::Version;
use serde::Deserialize;
use serde::Serialize;

/// The normalized form of a manifest file, restricted to the
/// attributes the resolver consumes. Registry documents and manifests
/// in the wild contain `null` and mistyped collections, so collection
/// fields deserialize leniently and drop invalid entries.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub version: Option<Version>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub dev_dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub optional_dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub peer_dependencies: HashMap<String, String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::hashmap")]
  pub resolutions: HashMap<String, String>,
  #[serde(default)]
  pub workspaces: Option<WorkspacesField>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::null_default")]
  pub private: bool,
  /// Whether this project requires flat resolution (a single version
  /// per package name).
  #[serde(default)]
  #[serde(deserialize_with = "lenient::null_default")]
  pub flat: bool,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::vector")]
  pub os: Vec<String>,
  #[serde(default)]
  #[serde(deserialize_with = "lenient::vector")]
  pub cpu: Vec<String>,
}

impl Manifest {
  /// The name, or an empty string for nameless manifests. Most lookup
  /// tables key on this.
  pub fn name_str(&self) -> &str {
    self.name.as_deref().unwrap_or("")
  }

  /// Reads the root manifest from a directory, trying each backend's
  /// file name in preference order. Returns which backend owns the
  /// file that was found.
  pub async fn from_directory(
    dir: &std::path::Path,
  ) -> Result<Option<(crate::registry::RegistryKind, Manifest)>, crate::error::UserError>
  {
    use crate::registry::RegistryKind;
    for kind in [RegistryKind::Gantry, RegistryKind::Npm] {
      let path = dir.join(kind.manifest_filename());
      match tokio::fs::read_to_string(&path).await {
        Ok(text) => {
          let manifest = serde_json::from_str(&text).map_err(|err| {
            crate::error::UserError(format!(
              "Failed parsing {}: {err}",
              path.display()
            ))
          })?;
          return Ok(Some((kind, manifest)));
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
        Err(err) => {
          return Err(crate::error::UserError(format!(
            "Failed reading {}: {err}",
            path.display()
          )));
        }
      }
    }
    Ok(None)
  }
}

/// The `workspaces` field: either a bare array of globs or an object
/// with `packages` and `nohoist` lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WorkspacesField {
  Globs(Vec<String>),
  Config(WorkspacesConfig),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspacesConfig {
  #[serde(default)]
  pub packages: Option<Vec<String>>,
  #[serde(default)]
  pub nohoist: Option<Vec<String>>,
}

impl WorkspacesField {
  pub fn packages(&self) -> &[String] {
    match self {
      WorkspacesField::Globs(globs) => globs,
      WorkspacesField::Config(config) => {
        config.packages.as_deref().unwrap_or(&[])
      }
    }
  }

  pub fn nohoist(&self) -> &[String] {
    match self {
      WorkspacesField::Globs(_) => &[],
      WorkspacesField::Config(config) => {
        config.nohoist.as_deref().unwrap_or(&[])
      }
    }
  }
}

pub(crate) mod lenient {
  use std::collections::HashMap;
  use std::fmt;

  use serde::de;
  use serde::de::DeserializeOwned;
  use serde::de::MapAccess;
  use serde::de::SeqAccess;
  use serde::de::Visitor;
  use serde::Deserialize;
  use serde::Deserializer;

  /// Deserializes `null` to the default value. Registries accept
  /// uploads with `null` where serde expects a concrete value.
  pub fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
  where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
  {
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
  }

  pub fn hashmap<'de, K, V, D>(
    deserializer: D,
  ) -> Result<HashMap<K, V>, D::Error>
  where
    K: Deserialize<'de> + Eq + std::hash::Hash,
    V: DeserializeOwned,
    D: Deserializer<'de>,
  {
    deserializer.deserialize_option(HashMapVisitor::<K, V> {
      marker: std::marker::PhantomData,
    })
  }

  pub fn vector<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
  where
    T: DeserializeOwned,
    D: Deserializer<'de>,
  {
    deserializer.deserialize_option(VectorVisitor::<T> {
      marker: std::marker::PhantomData,
    })
  }

  struct HashMapVisitor<K, V> {
    marker: std::marker::PhantomData<fn() -> HashMap<K, V>>,
  }

  impl<'de, K, V> Visitor<'de> for HashMapVisitor<K, V>
  where
    K: Deserialize<'de> + Eq + std::hash::Hash,
    V: DeserializeOwned,
  {
    type Value = HashMap<K, V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
      formatter.write_str("a map or null")
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(HashMap::new())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
      D: Deserializer<'de>,
    {
      deserializer.deserialize_any(self)
    }

    fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
    where
      M: MapAccess<'de>,
    {
      let mut hashmap = HashMap::new();

      // deserialize to a serde_json::Value first so invalid entries
      // are skipped over instead of failing the document
      while let Some(entry) = map.next_entry::<K, serde_json::Value>()? {
        if let Ok(value) = serde_json::from_value(entry.1) {
          hashmap.insert(entry.0, value);
        }
      }

      Ok(hashmap)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
      A: SeqAccess<'de>,
    {
      while seq.next_element::<de::IgnoredAny>()?.is_some() {}
      Ok(HashMap::new())
    }

    fn visit_bool<E>(self, _v: bool) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(HashMap::new())
    }

    fn visit_i64<E>(self, _v: i64) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(HashMap::new())
    }

    fn visit_u64<E>(self, _v: u64) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(HashMap::new())
    }

    fn visit_f64<E>(self, _v: f64) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(HashMap::new())
    }

    fn visit_str<E>(self, _v: &str) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(HashMap::new())
    }
  }

  struct VectorVisitor<T> {
    marker: std::marker::PhantomData<fn() -> Vec<T>>,
  }

  impl<'de, T> Visitor<'de> for VectorVisitor<T>
  where
    T: DeserializeOwned,
  {
    type Value = Vec<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
      formatter.write_str("a sequence or null")
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(Vec::new())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
      D: Deserializer<'de>,
    {
      deserializer.deserialize_any(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
      A: SeqAccess<'de>,
    {
      let mut vec = Vec::new();

      while let Some(value) = seq.next_element::<serde_json::Value>()? {
        if let Ok(value) = serde_json::from_value(value) {
          vec.push(value);
        }
      }

      Ok(vec)
    }

    fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
    where
      M: MapAccess<'de>,
    {
      while map
        .next_entry::<de::IgnoredAny, de::IgnoredAny>()?
        .is_some()
      {}
      Ok(Vec::new())
    }

    fn visit_bool<E>(self, _v: bool) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(Vec::new())
    }

    fn visit_i64<E>(self, _v: i64) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(Vec::new())
    }

    fn visit_u64<E>(self, _v: u64) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(Vec::new())
    }

    fn visit_f64<E>(self, _v: f64) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(Vec::new())
    }

    fn visit_str<E>(self, _v: &str) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      Ok(Vec::new())
    }
  }
}
