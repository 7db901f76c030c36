//! Module fallback resolution
//!
//! Serves specifiers the primary module pipeline could not: a bare package
//! that does not exist at its literal path is answered with a redirect to
//! the file node-style resolution finds, and an existing file is bundled into
//! one self-contained ES module.

use crate::bundler::{
    BundleRequest, InlineAllowList, ModuleBundler, NativeBundler, DEFAULT_INLINE_PACKAGES, SANDBOX_CONDITIONS,
    SANDBOX_MAIN_FIELDS,
};
use crate::error::{ResolveError, TransformError};
use crate::esbuild::EsbuildBundler;
use crate::node_resolve::PackageResolver;
use crate::normalize::{decode_specifier, location_for, normalize_specifier, relative_to_root, root_path};
use edgedev_common::path::dirname;
use edgedev_common::{FallbackQuery, InlineModule, ResolverResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundlerKind {
    #[default]
    Native,
    Esbuild,
}

#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Directory normalized paths are joined onto
    pub root: PathBuf,
    pub inline_packages: Vec<String>,
    pub bundler: BundlerKind,
    /// `esbuild` from `PATH` when unset
    pub esbuild_path: Option<PathBuf>,
    /// Conditions and main fields used while bundling
    pub conditions: Vec<String>,
    pub main_fields: Vec<String>,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            inline_packages: DEFAULT_INLINE_PACKAGES.iter().map(|p| p.to_string()).collect(),
            bundler: BundlerKind::Native,
            esbuild_path: None,
            conditions: SANDBOX_CONDITIONS.iter().map(|c| c.to_string()).collect(),
            main_fields: SANDBOX_MAIN_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl FallbackError {
    /// HTTP status of the fallback contract
    pub fn status(&self) -> u16 {
        match self {
            FallbackError::Resolve(_) => 404,
            FallbackError::Transform(_) => 500,
        }
    }
}

pub struct FallbackResolver {
    root: PathBuf,
    resolver: PackageResolver,
    bundler: Arc<dyn ModuleBundler>,
}

impl FallbackResolver {
    pub fn new(options: FallbackOptions) -> Self {
        let allow = InlineAllowList::new(options.inline_packages);
        let bundler: Arc<dyn ModuleBundler> = match options.bundler {
            BundlerKind::Native => Arc::new(NativeBundler::new(allow).with_resolver(PackageResolver::with_conditions(
                options.conditions,
                options.main_fields,
            ))),
            BundlerKind::Esbuild => {
                let mut esbuild = EsbuildBundler::new(allow).with_conditions(options.conditions, options.main_fields);
                if let Some(path) = options.esbuild_path {
                    esbuild = esbuild.with_executable(path);
                }
                Arc::new(esbuild)
            }
        };
        Self::with_bundler(options.root, bundler)
    }

    pub fn with_bundler(root: impl Into<PathBuf>, bundler: Arc<dyn ModuleBundler>) -> Self {
        Self {
            root: root.into(),
            resolver: PackageResolver::default(),
            bundler,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bundler_name(&self) -> &'static str {
        self.bundler.name()
    }

    /// Query values arrive percent-encoded and are decoded exactly once
    /// here, before normalization.
    fn normalize_field(&self, value: Option<&str>) -> Result<String, ResolveError> {
        let decoded = value.map(decode_specifier);
        let normalized = normalize_specifier(decoded.as_deref())?;
        Ok(relative_to_root(&self.root, &normalized))
    }

    pub async fn resolve(&self, query: &FallbackQuery) -> Result<ResolverResult, FallbackError> {
        let specifier = self.normalize_field(query.specifier.as_deref())?;
        let referrer = match query.referrer.as_deref().filter(|r| !r.is_empty()) {
            Some(referrer) => Some(self.normalize_field(Some(referrer))?),
            None => None,
        };
        // The specifier as the importer wrote it. Classification looks at
        // its decoded form; resolution uses the normalized one.
        let (raw, is_path) = match query.raw_specifier.as_deref().filter(|r| !r.is_empty()) {
            Some(raw) => {
                let decoded = decode_specifier(raw);
                let is_path = decoded.starts_with('.') || decoded.starts_with('/');
                (normalize_specifier(Some(&decoded))?, is_path)
            }
            None => (specifier.clone(), false),
        };

        let target = root_path(&self.root, &specifier);
        debug!(
            specifier = %specifier,
            raw = %raw,
            referrer = ?referrer,
            method = %query.method,
            "Fallback resolution"
        );

        if !is_path && !target.exists() {
            let from_dir = match &referrer {
                Some(referrer) => root_path(&self.root, dirname(referrer)),
                None => self.root.clone(),
            };
            let resolved = self.resolver.resolve(&raw, &from_dir, query.method)?;
            let location = location_for(&self.root, &resolved);
            info!(specifier = %raw, location = %location, "Redirecting bare specifier");
            return Ok(ResolverResult::Redirect { location });
        }

        let entry = self.resolver.resolve_path(&target).ok_or_else(|| ResolveError::NotFound {
            specifier: specifier.clone(),
            from: referrer.clone().unwrap_or_else(|| self.root.display().to_string()),
        })?;
        let es_module = self
            .bundler
            .bundle(BundleRequest {
                entry,
                root: self.root.clone(),
                raw_specifier: raw,
            })
            .await?;
        info!(
            specifier = %specifier,
            bundler = self.bundler.name(),
            size = es_module.len(),
            "Bundled fallback module"
        );
        Ok(ResolverResult::Inline(InlineModule {
            name: specifier,
            es_module,
        }))
    }
}
