// Copyright 2024-2026 the Gantry authors. MIT license.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use thiserror::Error;

use crate::rcfile::parse_rc_file;
use crate::rcfile::RcFile;
use crate::rcfile::RcValue;
use crate::rcfile::RC_FILENAME;
use crate::registry::RegistryKind;

const ENV_PREFIX: &str = "GANTRY_";

pub const DEFAULT_NETWORK_CONCURRENCY: usize = 8;
pub const DEFAULT_CHILD_CONCURRENCY: usize = 5;
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Aggregated configuration for one resolver run: defaults, overlaid
/// by rc-file values (home first, then project), overlaid by
/// `GANTRY_*` environment variables. Command-line flags are applied
/// last by the caller mutating the public fields.
pub struct Config {
  pub cwd: PathBuf,
  pub lockfile_folder: PathBuf,
  pub cache_folder: PathBuf,
  pub global_folder: PathBuf,
  pub link_folder: PathBuf,
  pub modules_folder: Option<PathBuf>,

  pub offline: bool,
  pub prefer_offline: bool,
  pub frozen: bool,
  pub flat: bool,
  pub focus: bool,
  pub update_checksums: bool,
  pub ignore_platform: bool,
  pub ignore_engines: bool,
  pub ignore_scripts: bool,
  pub production: bool,
  pub loose_semver: bool,
  pub workspaces_enabled: bool,
  pub workspaces_nohoist_enabled: bool,

  pub network_concurrency: usize,
  pub child_concurrency: usize,
  pub network_timeout: Duration,

  pub http_proxy: Option<String>,
  pub https_proxy: Option<String>,
  pub registry: Option<String>,
  pub otp: Option<String>,

  /// Per-scope registries and per-host credentials from rc files,
  /// consumed by the concrete registry backends.
  pub rc: RcFile,

  pub request_cache: RequestCache,
}

impl std::fmt::Debug for Config {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Config")
      .field("cwd", &self.cwd)
      .field("offline", &self.offline)
      .field("frozen", &self.frozen)
      .field("flat", &self.flat)
      .field("production", &self.production)
      .field("network_concurrency", &self.network_concurrency)
      .finish_non_exhaustive()
  }
}

impl Config {
  pub fn new(cwd: PathBuf) -> Self {
    let home = std::env::var_os("HOME")
      .or_else(|| std::env::var_os("USERPROFILE"))
      .map(PathBuf::from)
      .unwrap_or_else(|| cwd.clone());
    let gantry_home = home.join(".gantry");
    Self {
      lockfile_folder: cwd.clone(),
      cache_folder: gantry_home.join("cache"),
      global_folder: gantry_home.join("global"),
      link_folder: gantry_home.join("links"),
      modules_folder: None,
      cwd,
      offline: false,
      prefer_offline: false,
      frozen: false,
      flat: false,
      focus: false,
      update_checksums: false,
      ignore_platform: false,
      ignore_engines: false,
      ignore_scripts: false,
      production: false,
      loose_semver: false,
      workspaces_enabled: true,
      workspaces_nohoist_enabled: false,
      network_concurrency: DEFAULT_NETWORK_CONCURRENCY,
      child_concurrency: DEFAULT_CHILD_CONCURRENCY,
      network_timeout: DEFAULT_NETWORK_TIMEOUT,
      http_proxy: None,
      https_proxy: None,
      registry: None,
      otp: None,
      rc: RcFile::default(),
      request_cache: RequestCache::default(),
    }
  }

  /// Loads configuration the standard way: home rc, project rc, then
  /// environment.
  pub async fn load(cwd: PathBuf) -> Self {
    let mut rc = RcFile::default();
    let mut rc_paths = Vec::new();
    if let Some(home) = std::env::var_os("HOME")
      .or_else(|| std::env::var_os("USERPROFILE"))
    {
      rc_paths.push(PathBuf::from(home).join(RC_FILENAME));
    }
    rc_paths.push(cwd.join(RC_FILENAME));
    for path in rc_paths {
      if let Ok(text) = tokio::fs::read_to_string(&path).await {
        match parse_rc_file(&text, &|name| std::env::var(name).ok()) {
          Ok(parsed) => rc.merge(parsed),
          Err(err) => {
            log::warn!("Ignoring unparseable rc file {}: {err}", path.display())
          }
        }
      }
    }
    let env: HashMap<String, String> = std::env::vars().collect();
    Self::from_parts(cwd, rc, &env)
  }

  /// Builds a config from already-gathered inputs. Split out from
  /// [`Config::load`] for tests.
  pub fn from_parts(
    cwd: PathBuf,
    rc: RcFile,
    env: &HashMap<String, String>,
  ) -> Self {
    let mut config = Self::new(cwd);
    let values: Vec<(String, RcValue)> = rc
      .values
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    config.rc = rc;
    for (key, value) in values {
      config.apply_value(&normalize_key(&key), &value);
    }
    let mut env_entries: Vec<(&String, &String)> = env
      .iter()
      .filter(|(key, _)| key.starts_with(ENV_PREFIX))
      .collect();
    env_entries.sort();
    for (key, value) in env_entries {
      let key = normalize_key(&key[ENV_PREFIX.len()..]);
      config.apply_value(&key, &RcValue::String(value.clone()));
    }
    config
  }

  fn apply_value(&mut self, key: &str, value: &RcValue) {
    fn set_bool(target: &mut bool, value: &RcValue) {
      if let Some(flag) = value.as_bool() {
        *target = flag;
      }
    }
    fn set_number(target: &mut usize, value: &RcValue) {
      if let Some(number) = value.as_number() {
        if number > 0 {
          *target = number as usize;
        }
      }
    }
    fn set_string(target: &mut Option<String>, value: &RcValue) {
      if let Some(text) = value.as_str() {
        *target = Some(text.to_string());
      }
    }
    fn set_path(target: &mut PathBuf, value: &RcValue) {
      if let Some(text) = value.as_str() {
        *target = PathBuf::from(text);
      }
    }

    match key {
      "offline" => set_bool(&mut self.offline, value),
      "prefer-offline" => set_bool(&mut self.prefer_offline, value),
      "frozen-lockfile" => set_bool(&mut self.frozen, value),
      "flat" => set_bool(&mut self.flat, value),
      "focus" => set_bool(&mut self.focus, value),
      "update-checksums" => set_bool(&mut self.update_checksums, value),
      "ignore-platform" => set_bool(&mut self.ignore_platform, value),
      "ignore-engines" => set_bool(&mut self.ignore_engines, value),
      "ignore-scripts" => set_bool(&mut self.ignore_scripts, value),
      "production" => set_bool(&mut self.production, value),
      "loose-semver" => set_bool(&mut self.loose_semver, value),
      "workspaces-enabled" => set_bool(&mut self.workspaces_enabled, value),
      "workspaces-nohoist-enabled" => {
        set_bool(&mut self.workspaces_nohoist_enabled, value)
      }
      "network-concurrency" => {
        set_number(&mut self.network_concurrency, value)
      }
      "child-concurrency" => set_number(&mut self.child_concurrency, value),
      "network-timeout" => {
        // milliseconds on the wire, like the rest of the ecosystem
        if let Some(ms) = value.as_number() {
          if ms > 0 {
            self.network_timeout = Duration::from_millis(ms as u64);
          }
        }
      }
      "http-proxy" | "proxy" => set_string(&mut self.http_proxy, value),
      "https-proxy" => set_string(&mut self.https_proxy, value),
      "registry" => set_string(&mut self.registry, value),
      "otp" => set_string(&mut self.otp, value),
      "cache-folder" => set_path(&mut self.cache_folder, value),
      "global-folder" => set_path(&mut self.global_folder, value),
      "link-folder" => set_path(&mut self.link_folder, value),
      "lockfile-folder" => set_path(&mut self.lockfile_folder, value),
      "modules-folder" => {
        if let Some(text) = value.as_str() {
          self.modules_folder = Some(PathBuf::from(text));
        }
      }
      _ => {}
    }
  }

  /// The cache-folder key for one concrete package: registry, name and
  /// version, with the uid appended when a non-registry source forced
  /// a distinct identity.
  pub fn generate_module_cache_key(
    &self,
    registry: RegistryKind,
    name: &str,
    version: &str,
    uid: &str,
  ) -> String {
    // scoped names would create nested cache folders
    let name = name.replace('/', "-");
    if uid == version {
      format!("{}-{}-{}", registry.as_str(), name, version)
    } else {
      format!("{}-{}-{}-{}", registry.as_str(), name, version, uid)
    }
  }
}

fn normalize_key(key: &str) -> String {
  key.trim().to_ascii_lowercase().replace('_', "-")
}

#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct RequestCacheError(#[from] Arc<anyhow::Error>);

type CacheFuture =
  Shared<LocalBoxFuture<'static, Result<Rc<dyn Any>, RequestCacheError>>>;

/// Get-or-factory memoization keyed by string: concurrent callers for
/// the same key await the same in-flight factory; a factory rejection
/// clears the slot so a retry can repopulate it.
#[derive(Default)]
pub struct RequestCache {
  slots: RefCell<HashMap<String, CacheFuture>>,
}

impl RequestCache {
  pub async fn get_or_init<T, F, Fut>(
    &self,
    key: &str,
    factory: F,
  ) -> Result<Rc<T>, RequestCacheError>
  where
    T: 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + 'static,
  {
    let future = {
      let mut slots = self.slots.borrow_mut();
      match slots.get(key) {
        Some(existing) => existing.clone(),
        None => {
          let task = factory();
          let shared: CacheFuture = async move {
            match task.await {
              Ok(value) => Ok(Rc::new(value) as Rc<dyn Any>),
              Err(err) => Err(RequestCacheError(Arc::new(err))),
            }
          }
          .boxed_local()
          .shared();
          slots.insert(key.to_string(), shared.clone());
          shared
        }
      }
    };
    match future.clone().await {
      Ok(value) => value.downcast::<T>().map_err(|_| {
        RequestCacheError(Arc::new(anyhow::anyhow!(
          "mismatched cache value type for key '{key}'"
        )))
      }),
      Err(err) => {
        let mut slots = self.slots.borrow_mut();
        if slots.get(key).is_some_and(|slot| slot.ptr_eq(&future)) {
          slots.remove(key);
        }
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod test {
  use std::cell::Cell;

  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn defaults() {
    let config = Config::new(PathBuf::from("/tmp/project"));
    assert_eq!(config.network_concurrency, 8);
    assert_eq!(config.child_concurrency, 5);
    assert_eq!(config.network_timeout, Duration::from_secs(30));
    assert!(!config.offline);
    assert!(config.workspaces_enabled);
    assert_eq!(config.lockfile_folder, PathBuf::from("/tmp/project"));
  }

  #[test]
  fn rc_then_env_precedence() {
    let rc = parse_rc_file(
      "network-concurrency = 4\nflat = true\nregistry = \"https://rc\"\n",
      &|_| None,
    )
    .unwrap();
    let env = HashMap::from([
      ("GANTRY_NETWORK_CONCURRENCY".to_string(), "2".to_string()),
      ("GANTRY_OFFLINE".to_string(), "true".to_string()),
      ("UNRELATED".to_string(), "x".to_string()),
    ]);
    let config = Config::from_parts(PathBuf::from("/p"), rc, &env);
    // env wins over rc
    assert_eq!(config.network_concurrency, 2);
    assert!(config.offline);
    // rc values that the env leaves alone survive
    assert!(config.flat);
    assert_eq!(config.registry.as_deref(), Some("https://rc"));
  }

  #[test]
  fn module_cache_keys() {
    let config = Config::new(PathBuf::from("/p"));
    assert_eq!(
      config.generate_module_cache_key(
        RegistryKind::Gantry,
        "a",
        "1.0.0",
        "1.0.0"
      ),
      "gantry-a-1.0.0"
    );
    assert_eq!(
      config.generate_module_cache_key(
        RegistryKind::Npm,
        "@scope/a",
        "1.0.0",
        "1.0.0-abc"
      ),
      "npm-@scope-a-1.0.0-1.0.0-abc"
    );
  }

  #[tokio::test]
  async fn request_cache_shares_in_flight_factories() {
    let cache = RequestCache::default();
    let calls = Rc::new(Cell::new(0));

    let first = cache.get_or_init("key", {
      let calls = calls.clone();
      move || async move {
        calls.set(calls.get() + 1);
        tokio::task::yield_now().await;
        Ok(42u32)
      }
    });
    let second = cache.get_or_init("key", {
      let calls = calls.clone();
      move || async move {
        calls.set(calls.get() + 1);
        Ok(0u32)
      }
    });
    let (first, second) = futures::join!(first, second);
    assert_eq!(*first.unwrap(), 42);
    assert_eq!(*second.unwrap(), 42);
    assert_eq!(calls.get(), 1);
  }

  #[tokio::test]
  async fn request_cache_retries_after_failure() {
    let cache = RequestCache::default();

    let result = cache
      .get_or_init::<u32, _, _>("key", || async {
        anyhow::bail!("transient")
      })
      .await;
    assert!(result.is_err());

    // the failed slot was cleared, so the factory runs again
    let result = cache.get_or_init("key", || async { Ok(7u32) }).await;
    assert_eq!(*result.unwrap(), 7);
  }
}
