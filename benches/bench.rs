// Copyright 2024-2026 the Gantry authors. MIT license.

use gantry_resolve::config::Config;
use gantry_resolve::lockfile::Lockfile;
use gantry_resolve::registry::RegistryKind;
use gantry_resolve::registry::TestRegistryApi;
use gantry_resolve::resolution::PackageRequest;
use gantry_resolve::resolution::PackageResolver;
use gantry_resolve::resolution::ResolutionMap;
use gantry_resolve::resolution::ResolverOptions;

fn main() {
  divan::main();
}

mod resolution {
  use super::*;

  #[divan::bench]
  fn deep_chain() {
    const VERSION_COUNT: usize = 25;
    let api = TestRegistryApi::default();
    let mut roots = Vec::new();
    for pkg_index in 0..26 {
      let pkg_name = format!("a{pkg_index}");
      let next_pkg = format!("a{}", pkg_index + 1);
      for version_index in 0..VERSION_COUNT {
        let version = format!("{version_index}.0.0");
        if pkg_index == 0 {
          roots.push(format!("{pkg_name}@{version}"));
        }
        api.ensure_package_version(&pkg_name, &version);
        if pkg_index < 25 {
          api.add_dependency(
            (pkg_name.as_str(), version.as_str()),
            (next_pkg.as_str(), version.as_str()),
          );
        }
      }
    }

    let rt = tokio::runtime::Builder::new_current_thread()
      .enable_time()
      .build()
      .unwrap();
    let config = Config::new(std::path::PathBuf::from("/tmp/gantry-bench"));
    let pattern_count = rt.block_on(async {
      let mut resolver = PackageResolver::new(
        &api,
        &config,
        Lockfile::default(),
        ResolutionMap::default(),
      );
      let deps = roots
        .iter()
        .map(|pattern| {
          PackageRequest::root(pattern.clone(), RegistryKind::Gantry, false)
        })
        .collect();
      resolver
        .init(
          deps,
          ResolverOptions {
            is_flat: false,
            is_frozen: false,
            workspace_layout: None,
          },
        )
        .await
        .unwrap();
      resolver.pattern_count()
    });

    assert!(pattern_count >= VERSION_COUNT);
  }
}
