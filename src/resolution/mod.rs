// Copyright 2024-2026 the Gantry authors. MIT license.

pub mod common;
pub mod queue;
pub mod reference;
pub mod request;
pub mod resolutions;
mod resolver;

pub use queue::TaskQueue;
pub use reference::ManifestIdx;
pub use reference::Optionality;
pub use reference::PackageReference;
pub use reference::ReferenceIdx;
pub use request::child_requests;
pub use request::root_requests;
pub use request::PackageRequest;
pub use resolutions::ResolutionMap;
pub use resolver::PackageResolver;
pub use resolver::ResolvedManifest;
pub use resolver::ResolverOptions;
