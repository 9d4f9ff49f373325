// Copyright 2024-2026 the Gantry authors. MIT license.

//! The package resolver: owns the patterns map, schedules requests on
//! a bounded work pool, runs the late-arrival consolidation pass and
//! the optional flatten pass, and serializes the result back into
//! lockfile form.
//!
//! Resolution is deliberately greedy: the highest satisfying version
//! wins, ties resolve by discovery order, and the late-arrival pass
//! may collapse equivalent peers but never retracts a committed
//! choice.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use deno_semver::Version;
use log::debug;
use log::warn;

use crate::config::Config;
use crate::error::FlatConflict;
use crate::error::ResolveError;
use crate::error::UserError;
use crate::exotic_kind;
use crate::is_exotic_range;
use crate::lockfile;
use crate::lockfile::Lockfile;
use crate::lockfile::LockfileEntry;
use crate::lockfile::ParseKind;
use crate::manifest::Manifest;
use crate::normalize_pattern;
use crate::registry::ExoticPackageInfo;
use crate::registry::ExoticSpecifier;
use crate::registry::PackageInfo;
use crate::registry::RegistryApi;
use crate::registry::RegistryKind;
use crate::registry::RegistryPackageInfoLoadError;
use crate::registry::RemoteDescriptor;
use crate::registry::RemoteKind;
use crate::resolution::common;
use crate::resolution::queue::TaskQueue;
use crate::resolution::reference::ManifestIdx;
use crate::resolution::reference::PackageReference;
use crate::resolution::reference::ReferenceIdx;
use crate::resolution::request;
use crate::resolution::request::PackageRequest;
use crate::resolution::resolutions::ResolutionMap;
use crate::system_info::matches_platform_list;
use crate::system_info::SystemInfo;
use crate::workspace::WorkspaceLayout;
use crate::ExoticKind;

pub struct ResolverOptions {
  pub is_flat: bool,
  pub is_frozen: bool,
  pub workspace_layout: Option<WorkspaceLayout>,
}

/// One slot in the resolver's manifest arena: the normalized manifest
/// plus the back-references resolution attached to it.
#[derive(Debug)]
pub struct ResolvedManifest {
  pub manifest: Manifest,
  pub remote: RemoteDescriptor,
  pub reference: ReferenceIdx,
  pub registry: RegistryKind,
  /// On-disk location for workspace members.
  pub loc: Option<PathBuf>,
  pub fresh: bool,
  pub prebuilt_variants: BTreeMap<String, String>,
}

/// A request parked during the find phase because a satisfying version
/// was already known. Commitment happens after the queue drains, when
/// a better late arrival may exist.
#[derive(Debug)]
struct DeferredBinding {
  request: PackageRequest,
  /// The reference that satisfied the request when it was deferred.
  seen: ReferenceIdx,
}

enum FetchResult {
  Registry(Result<Arc<PackageInfo>, RegistryPackageInfoLoadError>),
  Exotic(Result<ExoticPackageInfo, RegistryPackageInfoLoadError>),
}

type FetchOutcome = (PackageRequest, FetchResult);
type FetchQueue<'a> = TaskQueue<'a, FetchOutcome>;

#[derive(Debug)]
pub struct PackageResolver<'a, TApi: RegistryApi> {
  api: &'a TApi,
  config: &'a Config,
  pub system_info: SystemInfo,
  flat: bool,
  frozen: bool,
  workspace_layout: Option<WorkspaceLayout>,
  lockfile: Lockfile,
  resolution_map: ResolutionMap,
  patterns: HashMap<String, ManifestIdx>,
  patterns_by_package: HashMap<String, Vec<String>>,
  fetching_patterns: HashSet<String>,
  delayed_resolve_queue: Vec<DeferredBinding>,
  manifests: Vec<ResolvedManifest>,
  references: Vec<PackageReference>,
  refs_by_identity: HashMap<(String, String, String), ReferenceIdx>,
  flat_conflicts: Vec<FlatConflict>,
}

impl<'a, TApi: RegistryApi> PackageResolver<'a, TApi> {
  pub fn new(
    api: &'a TApi,
    config: &'a Config,
    lockfile: Lockfile,
    resolution_map: ResolutionMap,
  ) -> Self {
    Self {
      api,
      config,
      system_info: SystemInfo::default(),
      flat: false,
      frozen: false,
      workspace_layout: None,
      lockfile,
      resolution_map,
      patterns: HashMap::new(),
      patterns_by_package: HashMap::new(),
      fetching_patterns: HashSet::new(),
      delayed_resolve_queue: Vec::new(),
      manifests: Vec::new(),
      references: Vec::new(),
      refs_by_identity: HashMap::new(),
      flat_conflicts: Vec::new(),
    }
  }

  /// Resolves a dependency set to completion.
  pub async fn init(
    &mut self,
    deps: Vec<PackageRequest>,
    options: ResolverOptions,
  ) -> Result<(), ResolveError> {
    self.flat = options.is_flat;
    self.frozen = options.is_frozen;
    self.workspace_layout = options.workspace_layout;

    match self.lockfile.parse_kind() {
      Some(ParseKind::Merge) => {
        warn!("Merge conflict in the lockfile was reconciled automatically");
      }
      Some(ParseKind::Conflict) => {
        warn!(
          "Merge conflict in the lockfile could not be reconciled; proceeding with a best-effort parse"
        );
      }
      _ => {}
    }

    let mut queue = TaskQueue::new(self.config.network_concurrency);

    // Phase 1 — find fan-out
    for request in deps {
      self.find(request, &mut queue, false)?;
    }
    self.drain(&mut queue).await?;

    // Phase 2 — existing-version pass
    for binding in std::mem::take(&mut self.delayed_resolve_queue) {
      self.resolve_to_existing_version(binding);
    }

    // Phase 3 — resolution-map delay drain
    self.drain_resolution_delays(&mut queue).await?;
    // a delayed pin may itself have parked requests
    for binding in std::mem::take(&mut self.delayed_resolve_queue) {
      self.resolve_to_existing_version(binding);
    }

    // Phase 4 — flatten
    if self.flat {
      let names: BTreeSet<String> =
        self.patterns_by_package.keys().cloned().collect();
      for name in names {
        self.optimize_resolutions(&name);
      }
    }

    Ok(())
  }

  async fn drain(
    &mut self,
    queue: &mut FetchQueue<'a>,
  ) -> Result<(), ResolveError> {
    while let Some((request, result)) = queue.next().await {
      match result {
        FetchResult::Registry(Ok(info)) => {
          self.commit_registry_fetch(request, &info, queue)?
        }
        FetchResult::Exotic(Ok(info)) => {
          self.commit_exotic_fetch(request, info, queue)?
        }
        FetchResult::Registry(Err(err)) | FetchResult::Exotic(Err(err)) => {
          self.handle_fetch_failure(request, err)?
        }
      }
    }
    Ok(())
  }

  /// One unit of find work, run synchronously between suspension
  /// points. Either completes the request against known state or
  /// schedules a fetch.
  fn find(
    &mut self,
    request: PackageRequest,
    queue: &mut FetchQueue<'a>,
    skip_override: bool,
  ) -> Result<(), ResolveError> {
    // 1. resolution override
    let request = if skip_override {
      request
    } else {
      match self.resolve_to_resolution(request) {
        Some(request) => request,
        None => return Ok(()),
      }
    };

    // 2. in-flight dedup
    if !self.fetching_patterns.insert(request.fetch_key()) {
      return Ok(());
    }

    // workspace siblings resolve in memory, ahead of the lockfile and
    // any registry
    if let Some(layout) = &self.workspace_layout {
      if let Some(member) = layout.get_manifest_by_pattern(&request.pattern) {
        let manifest = member.manifest.clone();
        let loc = member.loc.clone();
        let remote = RemoteDescriptor {
          kind: RemoteKind::Workspace,
          reference: loc.display().to_string(),
          hash: None,
          integrity: None,
          registry: request.registry,
        };
        debug!(
          "Resolved {} to the workspace at {}",
          request.pattern,
          loc.display()
        );
        return self
          .commit_resolved(request, manifest, remote, false, Some(loc), None, queue);
      }
    }

    // 3. lockfile probe
    if let Some(entry) = self.lockfile.get_locked(&request.pattern).cloned() {
      if lockfile::is_entry_stale(
        &entry,
        &request.pattern,
        self.config.loose_semver,
      ) {
        warn!(
          "Outdated lockfile entry for \"{}\"; resolving it afresh",
          request.pattern
        );
        self.lockfile.remove_pattern(&request.pattern);
        self.remove_pattern(&request.pattern);
      } else if let Some((manifest, remote)) =
        request::manifest_from_lockfile_entry(
          &request.pattern,
          &entry,
          request.registry,
          self.config.loose_semver,
        )
      {
        return self
          .commit_resolved(request, manifest, remote, false, None, Some(&entry), queue);
      } else {
        warn!(
          "Unusable lockfile entry for \"{}\"; resolving it afresh",
          request.pattern
        );
        self.lockfile.remove_pattern(&request.pattern);
        self.remove_pattern(&request.pattern);
      }
    }

    // from here on the request is fresh: it adds to or changes the
    // lockfile
    if self.frozen {
      return Err(
        UserError(format!(
          "The lockfile needs updating for \"{}\", but it is frozen.",
          request.pattern
        ))
        .into(),
      );
    }

    // 4. existing-version short-circuit: park it, a better candidate
    // may still arrive
    if let Some(seen) = self.find_satisfying_reference(&request) {
      debug!(
        "Deferred {} onto already-known {}@{}",
        request.pattern,
        self.references[seen.0].name,
        self.references[seen.0].version
      );
      self.delayed_resolve_queue.push(DeferredBinding { request, seen });
      return Ok(());
    }

    // 5. fetch
    self.schedule_fetch(request, queue)
  }

  /// Step 1 of the request lifecycle: apply the resolution map. Root
  /// requests and flat mode pass through untouched. Returns `None`
  /// when the request was consumed (attached or delayed).
  fn resolve_to_resolution(
    &mut self,
    request: PackageRequest,
  ) -> Option<PackageRequest> {
    if request.parent_names.is_empty() || self.flat {
      return Some(request);
    }
    let pinned = self
      .resolution_map
      .find(&request.pattern, &request.parent_names)?
      .resolved_pattern();
    if pinned == request.pattern {
      return Some(request);
    }
    debug!("Overriding {} with resolution {}", request.pattern, pinned);
    if self.patterns.contains_key(&pinned) {
      self.attach_to_pattern(&pinned, &request);
    } else {
      self.resolution_map.delay_queue.push(request);
    }
    None
  }

  /// Attaches a request's pattern to the reference another pattern
  /// already resolved to.
  fn attach_to_pattern(&mut self, target_pattern: &str, request: &PackageRequest) {
    let manifest_idx = self.patterns[target_pattern];
    let reference_idx = self.manifests[manifest_idx.0].reference;
    self.add_pattern_to(reference_idx, &request.pattern, manifest_idx);
    let reference = &mut self.references[reference_idx.0];
    reference.add_request(&request.pattern, request.level());
    reference.add_optional(request.optional);
    let version = reference.version.to_string();
    // a lockfile entry that disagrees with where the pattern ended up
    // is dropped so the next serialization re-records it
    if let Some(locked) = self.lockfile.get_locked(&request.pattern) {
      if locked.version != version {
        self.lockfile.remove_pattern(&request.pattern);
      }
    }
  }

  /// Step 4: the highest already-discovered reference satisfying this
  /// request, if any.
  fn find_satisfying_reference(
    &self,
    request: &PackageRequest,
  ) -> Option<ReferenceIdx> {
    let parts = normalize_pattern(&request.pattern);
    let (_, range) = request.registry_name_and_range();
    let candidates = self.patterns_by_package.get(parts.name)?;
    let exotic = is_exotic_range(range);
    let mut best: Option<ReferenceIdx> = None;
    for pattern in candidates {
      let Some(&manifest_idx) = self.patterns.get(pattern) else {
        continue;
      };
      let reference_idx = self.manifests[manifest_idx.0].reference;
      let reference = &self.references[reference_idx.0];
      let matched = if exotic {
        // an exotic request only matches a package discovered from the
        // very same reference text
        normalize_pattern(pattern).range == range
      } else {
        common::range_satisfies(range, &reference.version)
      };
      if matched {
        let is_better = best
          .map(|b| self.references[b.0].version < reference.version)
          .unwrap_or(true);
        if is_better {
          best = Some(reference_idx);
        }
      }
    }
    best
  }

  fn schedule_fetch(
    &mut self,
    request: PackageRequest,
    queue: &mut FetchQueue<'a>,
  ) -> Result<(), ResolveError> {
    let (name, range) = {
      let (name, range) = request.registry_name_and_range();
      (name.to_string(), range.to_string())
    };
    let api = self.api;
    let timeout = self.config.network_timeout;
    match exotic_kind(&range) {
      None => {
        queue.push(async move {
          let result =
            match tokio::time::timeout(timeout, api.package_info(&name)).await
            {
              Ok(result) => result,
              Err(_) => Err(RegistryPackageInfoLoadError::Timeout {
                package_name: name.clone(),
              }),
            };
          (request, FetchResult::Registry(result))
        });
        Ok(())
      }
      Some(ExoticKind::Workspace) => {
        // reachable only without a matching workspace layout
        if request.optional {
          warn!(
            "Ignoring optional workspace request \"{}\": no matching workspace",
            request.pattern
          );
          Ok(())
        } else {
          Err(
            UserError(format!(
              "\"{}\" requests a workspace sibling, but no matching workspace was found.",
              request.pattern
            ))
            .into(),
          )
        }
      }
      Some(kind) => {
        let specifier = ExoticSpecifier { kind, raw: range };
        queue.push(async move {
          let result = match tokio::time::timeout(
            timeout,
            api.exotic_info(&specifier),
          )
          .await
          {
            Ok(result) => result,
            Err(_) => Err(RegistryPackageInfoLoadError::Timeout {
              package_name: specifier.raw.clone(),
            }),
          };
          (request, FetchResult::Exotic(result))
        });
        Ok(())
      }
    }
  }

  fn commit_registry_fetch(
    &mut self,
    request: PackageRequest,
    info: &PackageInfo,
    queue: &mut FetchQueue<'a>,
  ) -> Result<(), ResolveError> {
    let range = request.registry_name_and_range().1.to_string();
    let version_req = match common::parse_range(&range) {
      Ok(req) => req,
      Err(err) => {
        if request.optional {
          warn!(
            "Skipping optional dependency \"{}\": invalid range: {err}",
            request.pattern
          );
          return Ok(());
        }
        return Err(
          UserError(format!(
            "Invalid range \"{range}\" in \"{}\": {err}",
            request.pattern
          ))
          .into(),
        );
      }
    };
    let version_info =
      match common::resolve_best_version_info(&version_req, info) {
        Ok(version_info) => version_info,
        Err(err) => {
          if request.optional {
            warn!(
              "Skipping optional dependency \"{}\": {err}",
              request.pattern
            );
            return Ok(());
          }
          return Err(err.into());
        }
      };
    debug!(
      "Resolved {} to {}@{}",
      request.pattern, info.name, version_info.version
    );
    let manifest = version_info.to_manifest(&info.name);
    let remote = RemoteDescriptor {
      kind: RemoteKind::Registry,
      reference: version_info.dist.tarball.clone(),
      hash: (!version_info.dist.shasum.is_empty())
        .then(|| version_info.dist.shasum.clone()),
      integrity: version_info.dist.integrity.clone(),
      registry: request.registry,
    };
    self.commit_resolved(request, manifest, remote, true, None, None, queue)
  }

  fn commit_exotic_fetch(
    &mut self,
    request: PackageRequest,
    info: ExoticPackageInfo,
    queue: &mut FetchQueue<'a>,
  ) -> Result<(), ResolveError> {
    let ExoticPackageInfo { mut manifest, remote } = info;
    if manifest.name.is_none() {
      manifest.name =
        Some(normalize_pattern(&request.pattern).name.to_string());
    }
    if manifest.version.is_none() {
      if request.optional {
        warn!(
          "Skipping optional dependency \"{}\": its manifest has no version",
          request.pattern
        );
        return Ok(());
      }
      return Err(
        UserError(format!(
          "The manifest behind \"{}\" does not declare a version.",
          request.pattern
        ))
        .into(),
      );
    }
    self.commit_resolved(request, manifest, remote, true, None, None, queue)
  }

  /// Records one concrete resolved package: collapses onto an existing
  /// reference when the identity is already known, otherwise creates
  /// the manifest/reference pair and recurses into dependencies.
  #[allow(clippy::too_many_arguments)]
  fn commit_resolved(
    &mut self,
    request: PackageRequest,
    manifest: Manifest,
    remote: RemoteDescriptor,
    fresh: bool,
    loc: Option<PathBuf>,
    locked: Option<&LockfileEntry>,
    queue: &mut FetchQueue<'a>,
  ) -> Result<(), ResolveError> {
    let name = manifest
      .name
      .clone()
      .unwrap_or_else(|| normalize_pattern(&request.pattern).name.to_string());
    let Some(version) = manifest.version.clone() else {
      return Err(
        UserError(format!(
          "\"{}\" resolved without a version.",
          request.pattern
        ))
        .into(),
      );
    };

    let identity =
      (name.clone(), version.to_string(), remote.remote_key());
    if let Some(&existing) = self.refs_by_identity.get(&identity) {
      // duplicate discovery collapses into one reference
      let manifest_idx = self.references[existing.0].manifest;
      self.add_pattern_to(existing, &request.pattern, manifest_idx);
      let reference = &mut self.references[existing.0];
      reference.add_request(&request.pattern, request.level());
      reference.add_optional(request.optional);
      return Ok(());
    }

    let compatible = self.config.ignore_platform
      || (matches_platform_list(&manifest.os, &self.system_info.os)
        && matches_platform_list(&manifest.cpu, &self.system_info.cpu));
    if !compatible && !request.optional {
      return Err(
        UserError(format!(
          "\"{name}@{version}\" is incompatible with this platform ({}/{}).",
          self.system_info.os, self.system_info.cpu
        ))
        .into(),
      );
    }

    let manifest_idx = ManifestIdx(self.manifests.len());
    let reference_idx = ReferenceIdx(self.references.len());
    let children = request::child_requests(&request, &manifest);

    self.manifests.push(ResolvedManifest {
      manifest,
      remote: remote.clone(),
      reference: reference_idx,
      registry: request.registry,
      loc: loc.clone(),
      fresh,
      prebuilt_variants: locked
        .map(|entry| entry.prebuilt_variants.clone())
        .unwrap_or_default(),
    });

    let mut reference =
      PackageReference::new(name, version, remote, manifest_idx, fresh);
    reference.add_request(&request.pattern, request.level());
    reference.add_optional(request.optional);
    if !compatible {
      reference.incompatible = true;
      reference.ignore = true;
    }
    if let Some(loc) = loc {
      reference.add_location(loc);
    }
    if let Some(entry) = locked {
      if let Some(uid) = &entry.uid {
        reference.uid = uid.clone();
      }
      for (key, value) in &entry.permissions {
        reference.set_permission(key, *value);
      }
    }
    reference.add_dependencies(children.iter().map(|c| c.pattern.clone()));
    self.references.push(reference);
    self.add_pattern_to(reference_idx, &request.pattern, manifest_idx);
    self.refs_by_identity.insert(identity, reference_idx);

    // 6. recurse
    for child in children {
      self.find(child, queue, false)?;
    }
    Ok(())
  }

  fn handle_fetch_failure(
    &mut self,
    request: PackageRequest,
    err: RegistryPackageInfoLoadError,
  ) -> Result<(), ResolveError> {
    if request.optional {
      warn!(
        "Ignoring failed optional dependency \"{}\": {err}",
        request.pattern
      );
      Ok(())
    } else {
      Err(err.into())
    }
  }

  /// Phase 2: commits a parked request onto the best now-known
  /// reference. The candidate seen at defer time is the fallback.
  fn resolve_to_existing_version(&mut self, binding: DeferredBinding) {
    let DeferredBinding { request, seen } = binding;
    let best = self.find_satisfying_reference(&request).unwrap_or(seen);
    debug!(
      "Attached {} to existing {}@{}",
      request.pattern, self.references[best.0].name, self.references[best.0].version
    );
    let manifest_idx = self.references[best.0].manifest;
    self.add_pattern_to(best, &request.pattern, manifest_idx);
    let reference = &mut self.references[best.0];
    reference.add_request(&request.pattern, request.level());
    reference.add_optional(request.optional);
  }

  /// Phase 3: re-evaluates pins whose target did not exist during the
  /// find phase, resolving the pinned pattern for real if it still
  /// does not.
  async fn drain_resolution_delays(
    &mut self,
    queue: &mut FetchQueue<'a>,
  ) -> Result<(), ResolveError> {
    let delayed = std::mem::take(&mut self.resolution_map.delay_queue);
    if delayed.is_empty() {
      return Ok(());
    }
    let mut pending_attach = Vec::new();
    for request in delayed {
      let Some(pinned) = self
        .resolution_map
        .find(&request.pattern, &request.parent_names)
        .map(|entry| entry.resolved_pattern())
      else {
        continue;
      };
      if self.patterns.contains_key(&pinned) {
        self.attach_to_pattern(&pinned, &request);
      } else {
        let pin_request = PackageRequest {
          pattern: pinned.clone(),
          registry: request.registry,
          optional: request.optional,
          parent_names: request.parent_names.clone(),
        };
        self.find(pin_request, queue, false)?;
        pending_attach.push((pinned, request));
      }
    }
    self.drain(queue).await?;
    for (pinned, request) in pending_attach {
      if self.patterns.contains_key(&pinned) {
        self.attach_to_pattern(&pinned, &request);
      } else {
        warn!(
          "Resolution \"{pinned}\" could not be resolved; \"{}\" keeps its own version",
          request.pattern
        );
        // give the pattern a normal resolution after all
        self.fetching_patterns.remove(&request.fetch_key());
        let mut retry_queue = TaskQueue::new(self.config.network_concurrency);
        self.find(request, &mut retry_queue, true)?;
        self.drain(&mut retry_queue).await?;
      }
    }
    Ok(())
  }

  /// Phase 4, per root dependency name: find one version satisfying
  /// every collapsible pattern and collapse them all onto it.
  fn optimize_resolutions(&mut self, name: &str) {
    let Some(patterns) = self.patterns_by_package.get(name).cloned() else {
      return;
    };
    let mut collapsible = Vec::new();
    for pattern in patterns {
      // patterns pinned by the lockfile or served by a workspace keep
      // their version
      if self.lockfile.get_locked(&pattern).is_some() {
        continue;
      }
      if is_exotic_range(normalize_pattern(&pattern).range) {
        continue;
      }
      let manifest_idx = self.patterns[&pattern];
      if self.manifests[manifest_idx.0].remote.kind == RemoteKind::Workspace {
        continue;
      }
      collapsible.push(pattern);
    }
    if collapsible.len() <= 1 {
      return;
    }

    let version_of = |resolver: &Self, pattern: &str| -> Version {
      let manifest_idx = resolver.patterns[pattern];
      let reference_idx = resolver.manifests[manifest_idx.0].reference;
      resolver.references[reference_idx.0].version.clone()
    };

    let mut versions: Vec<Version> = Vec::new();
    for pattern in &collapsible {
      let version = version_of(self, pattern);
      if !versions.contains(&version) {
        versions.push(version);
      }
    }
    versions.sort();
    versions.reverse();

    let ranges: Vec<String> = collapsible
      .iter()
      .map(|pattern| {
        let parts = normalize_pattern(pattern);
        crate::registry::parse_dep_entry_name_and_raw_version(
          parts.name,
          parts.range,
        )
        .1
        .to_string()
      })
      .collect();

    for version in &versions {
      if ranges
        .iter()
        .all(|range| common::range_satisfies(range, version))
      {
        debug!("Flattening {name} onto {version}");
        self.collapse_package_versions(name, version, &collapsible);
        return;
      }
    }

    let conflicting = collapsible
      .iter()
      .map(|pattern| (pattern.clone(), version_of(self, pattern)))
      .collect();
    self.flat_conflicts.push(FlatConflict {
      name: name.to_string(),
      conflicting,
    });
  }

  /// Re-points every given pattern (and everything else attached to
  /// their references) at the reference already resolved to `version`.
  fn collapse_package_versions(
    &mut self,
    name: &str,
    version: &Version,
    patterns: &[String],
  ) {
    let target = patterns.iter().find_map(|pattern| {
      let manifest_idx = *self.patterns.get(pattern)?;
      let reference_idx = self.manifests[manifest_idx.0].reference;
      (self.references[reference_idx.0].version == *version)
        .then_some((manifest_idx, reference_idx))
    });
    let Some((target_manifest, target_reference)) = target else {
      return;
    };
    for pattern in patterns {
      let Some(&manifest_idx) = self.patterns.get(pattern) else {
        continue;
      };
      let reference_idx = self.manifests[manifest_idx.0].reference;
      if reference_idx == target_reference {
        continue;
      }
      debug!("Collapsing {pattern} onto {name}@{version}");
      let captured = self.references[reference_idx.0].patterns.clone();
      self.prune_reference(reference_idx);
      for captured_pattern in captured {
        self.add_pattern_to(
          target_reference,
          &captured_pattern,
          target_manifest,
        );
      }
    }
  }

  fn add_pattern_to(
    &mut self,
    reference: ReferenceIdx,
    pattern: &str,
    manifest: ManifestIdx,
  ) {
    self.references[reference.0].add_pattern(pattern);
    self.patterns.insert(pattern.to_string(), manifest);
    let name = normalize_pattern(pattern).name.to_string();
    let list = self.patterns_by_package.entry(name).or_default();
    if !list.iter().any(|p| p == pattern) {
      list.push(pattern.to_string());
    }
  }

  fn remove_pattern(&mut self, pattern: &str) {
    let Some(manifest_idx) = self.patterns.remove(pattern) else {
      return;
    };
    let reference_idx = self.manifests[manifest_idx.0].reference;
    self.references[reference_idx.0].remove_pattern(pattern);
    let name = normalize_pattern(pattern).name.to_string();
    if let Some(list) = self.patterns_by_package.get_mut(&name) {
      list.retain(|p| p != pattern);
      if list.is_empty() {
        self.patterns_by_package.remove(&name);
      }
    }
  }

  /// Removes every pattern of a reference from the resolver. The
  /// reference slot stays in the arena but is unreachable afterwards.
  fn prune_reference(&mut self, reference_idx: ReferenceIdx) {
    let patterns =
      std::mem::take(&mut self.references[reference_idx.0].patterns);
    for pattern in &patterns {
      self.patterns.remove(pattern);
      let name = normalize_pattern(pattern).name.to_string();
      if let Some(list) = self.patterns_by_package.get_mut(&name) {
        list.retain(|p| p != pattern);
        if list.is_empty() {
          self.patterns_by_package.remove(&name);
        }
      }
    }
    let reference = &self.references[reference_idx.0];
    let identity = (
      reference.name.clone(),
      reference.version.to_string(),
      reference.remote.remote_key(),
    );
    if self.refs_by_identity.get(&identity) == Some(&reference_idx) {
      self.refs_by_identity.remove(&identity);
    }
  }

  /// Swaps the manifest behind a reference in place, preserving the
  /// stored name, freshness and prebuilt variants.
  pub fn update_manifest(
    &mut self,
    reference_idx: ReferenceIdx,
    mut new_manifest: Manifest,
  ) {
    let manifest_idx = self.references[reference_idx.0].manifest;
    let remote = self.references[reference_idx.0].remote.clone();
    let slot = &mut self.manifests[manifest_idx.0];
    new_manifest.name = slot.manifest.name.clone();
    slot.manifest = new_manifest;
    slot.reference = reference_idx;
    slot.remote = remote;
  }

  /// The resolved set in DFS post-order from the given seeds.
  pub fn get_topological_manifests(
    &self,
    seed_patterns: &[String],
  ) -> Vec<&ResolvedManifest> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for seed in seed_patterns {
      if let Some(&manifest_idx) = self.patterns.get(seed) {
        self.visit_topological(manifest_idx, &mut seen, &mut out);
      }
    }
    out.into_iter().map(|idx| &self.manifests[idx.0]).collect()
  }

  fn visit_topological(
    &self,
    manifest_idx: ManifestIdx,
    seen: &mut HashSet<ManifestIdx>,
    out: &mut Vec<ManifestIdx>,
  ) {
    if !seen.insert(manifest_idx) {
      return;
    }
    for child in self.child_manifests(manifest_idx) {
      self.visit_topological(child, seen, out);
    }
    out.push(manifest_idx);
  }

  /// The resolved set in BFS level order from the given seeds.
  pub fn get_level_order_manifests(
    &self,
    seed_patterns: &[String],
  ) -> Vec<&ResolvedManifest> {
    let mut seen = HashSet::new();
    let mut pending = VecDeque::new();
    let mut out = Vec::new();
    for seed in seed_patterns {
      if let Some(&manifest_idx) = self.patterns.get(seed) {
        if seen.insert(manifest_idx) {
          pending.push_back(manifest_idx);
        }
      }
    }
    while let Some(manifest_idx) = pending.pop_front() {
      out.push(manifest_idx);
      for child in self.child_manifests(manifest_idx) {
        if seen.insert(child) {
          pending.push_back(child);
        }
      }
    }
    out.into_iter().map(|idx| &self.manifests[idx.0]).collect()
  }

  fn child_manifests(
    &self,
    manifest_idx: ManifestIdx,
  ) -> Vec<ManifestIdx> {
    let reference_idx = self.manifests[manifest_idx.0].reference;
    self.references[reference_idx.0]
      .dependencies
      .iter()
      .filter_map(|pattern| self.patterns.get(pattern).copied())
      .collect()
  }

  pub fn pattern_count(&self) -> usize {
    self.patterns.len()
  }

  pub fn patterns(&self) -> impl Iterator<Item = (&str, &ResolvedManifest)> {
    self
      .patterns
      .iter()
      .map(|(pattern, idx)| (pattern.as_str(), &self.manifests[idx.0]))
  }

  pub fn get_resolved(
    &self,
    pattern: &str,
  ) -> Option<(&ResolvedManifest, &PackageReference)> {
    let &manifest_idx = self.patterns.get(pattern)?;
    let slot = &self.manifests[manifest_idx.0];
    Some((slot, &self.references[slot.reference.0]))
  }

  pub fn flat_conflicts(&self) -> &[FlatConflict] {
    &self.flat_conflicts
  }

  /// The serializable resolution result: one lockfile entry per
  /// pattern in the patterns map.
  pub fn lockfile_entries(&self) -> BTreeMap<String, LockfileEntry> {
    let mut entries = BTreeMap::new();
    for (pattern, &manifest_idx) in &self.patterns {
      let slot = &self.manifests[manifest_idx.0];
      let reference = &self.references[slot.reference.0];
      let version = reference.version.to_string();
      let entry = LockfileEntry {
        name: (normalize_pattern(pattern).name != reference.name)
          .then(|| reference.name.clone()),
        uid: (reference.uid != version).then(|| reference.uid.clone()),
        version,
        resolved: (slot.remote.kind != RemoteKind::Workspace
          && !slot.remote.reference.is_empty())
        .then(|| slot.remote.resolved()),
        integrity: slot.remote.integrity.clone(),
        registry: (reference.registry != RegistryKind::default())
          .then_some(reference.registry),
        dependencies: slot
          .manifest
          .dependencies
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect(),
        optional_dependencies: slot
          .manifest
          .optional_dependencies
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect(),
        permissions: reference.permissions.clone(),
        prebuilt_variants: slot.prebuilt_variants.clone(),
      };
      entries.insert(pattern.clone(), entry);
    }
    entries
  }

  /// Serializes the resolution into deterministic lockfile text.
  pub fn get_lockfile(&self) -> String {
    Lockfile::stringify_entries(&self.lockfile_entries())
  }
}
