//! Module fallback resolver
//!
//! Turns specifiers the dev server's own pipeline cannot serve into either a
//! redirect to the file they resolve to, or a self-contained ES module the
//! sandbox can evaluate. Also hosts the fetch-module service the sandbox's
//! module runner talks to.

pub mod bundler;
pub mod error;
pub mod esbuild;
pub mod fallback;
pub mod node_resolve;
pub mod normalize;
pub mod service;
pub mod transform;

pub use bundler::{
    BundleRequest, InlineAllowList, ModuleBundler, NativeBundler, DEFAULT_INLINE_PACKAGES, SANDBOX_CONDITIONS,
    SANDBOX_MAIN_FIELDS,
};
pub use error::{Location, ResolveError, TransformError};
pub use esbuild::EsbuildBundler;
pub use fallback::{BundlerKind, FallbackError, FallbackOptions, FallbackResolver};
pub use node_resolve::{PackageResolver, ResolveOptions};
pub use normalize::{decode_specifier, location_for, normalize_specifier, relative_to_root, root_path};
pub use service::{ModulePipeline, ModuleService, MAX_REDIRECTS};
