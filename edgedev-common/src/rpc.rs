//! Fetch-module RPC schema
//!
//! The sandbox asks the host for a module with `(moduleId, importerId,
//! options)`. On the wire this is a three element JSON array; the reply is a
//! [`FetchResult`].

use serde::{Deserialize, Serialize};

/// Options forwarded to the host transform pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchModuleOptions {
    /// The caller already holds a cached copy of this module
    #[serde(default)]
    pub cached: bool,
    /// Offset of the module body inside the wrapped function, for source maps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
}

type WireArgs = (String, Option<String>, FetchModuleOptions);

/// Arguments of one fetch-module call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireArgs", into = "WireArgs")]
pub struct FetchModuleArgs {
    pub id: String,
    pub importer: Option<String>,
    pub options: FetchModuleOptions,
}

impl FetchModuleArgs {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            importer: None,
            options: FetchModuleOptions::default(),
        }
    }

    pub fn with_importer(mut self, importer: impl Into<String>) -> Self {
        self.importer = Some(importer.into());
        self
    }

    pub fn with_options(mut self, options: FetchModuleOptions) -> Self {
        self.options = options;
        self
    }
}

impl From<WireArgs> for FetchModuleArgs {
    fn from((id, importer, options): WireArgs) -> Self {
        Self {
            id,
            importer,
            options,
        }
    }
}

impl From<FetchModuleArgs> for WireArgs {
    fn from(args: FetchModuleArgs) -> Self {
        (args.id, args.importer, args.options)
    }
}

/// How an externalized module should be loaded natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalKind {
    Builtin,
    Commonjs,
    Module,
    Network,
}

/// Transformed module source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineFetchResult {
    /// Runner-form code, see the context keys in `edgedev-sandbox`
    pub code: String,
    pub file: Option<String>,
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub invalidate: bool,
}

/// Instruction to load the module through the host's native import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFetchResult {
    pub externalize: String,
    #[serde(rename = "type")]
    pub kind: ExternalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFetchResult {
    pub cache: bool,
}

/// Reply to a fetch-module call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchResult {
    External(ExternalFetchResult),
    Inline(InlineFetchResult),
    Cached(CachedFetchResult),
}

impl FetchResult {
    pub fn inline(id: impl Into<String>, code: impl Into<String>) -> Self {
        let id = id.into();
        FetchResult::Inline(InlineFetchResult {
            code: code.into(),
            file: Some(id.clone()),
            url: id.clone(),
            id,
            invalidate: false,
        })
    }

    pub fn external(path: impl Into<String>, kind: ExternalKind) -> Self {
        FetchResult::External(ExternalFetchResult {
            externalize: path.into(),
            kind,
        })
    }
}
