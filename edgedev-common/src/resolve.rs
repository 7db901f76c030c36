//! Fallback resolution schema

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Header carrying the resolution method on fallback requests
pub const RESOLVE_METHOD_HEADER: &str = "X-Resolve-Method";

/// Which module convention asked for the specifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveMethod {
    #[default]
    Import,
    Require,
}

impl ResolveMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveMethod::Import => "import",
            ResolveMethod::Require => "require",
        }
    }
}

impl fmt::Display for ResolveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown resolve method '{0}', expected 'import' or 'require'")]
pub struct UnknownResolveMethod(pub String);

impl FromStr for ResolveMethod {
    type Err = UnknownResolveMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "import" => Ok(ResolveMethod::Import),
            "require" => Ok(ResolveMethod::Require),
            other => Err(UnknownResolveMethod(other.to_string())),
        }
    }
}

/// One fallback resolution request, as received from the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackQuery {
    /// Specifier after the sandbox's own resolution, possibly percent-encoded
    /// or `file:` prefixed
    pub specifier: Option<String>,
    /// Normalized path of the importing module
    pub referrer: Option<String>,
    /// Specifier exactly as written in source
    pub raw_specifier: Option<String>,
    #[serde(default)]
    pub method: ResolveMethod,
}

impl FallbackQuery {
    pub fn new(specifier: impl Into<String>) -> Self {
        let specifier = specifier.into();
        Self {
            raw_specifier: Some(specifier.clone()),
            specifier: Some(specifier),
            ..Default::default()
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_raw_specifier(mut self, raw: impl Into<String>) -> Self {
        self.raw_specifier = Some(raw.into());
        self
    }

    pub fn with_method(mut self, method: ResolveMethod) -> Self {
        self.method = method;
        self
    }
}

/// Self-contained ES module produced by the fallback bundler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineModule {
    pub name: String,
    pub es_module: String,
}

/// Outcome of one fallback resolution. Exactly one variant is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolverResult {
    /// The sandbox should re-request the module at `location`
    Redirect { location: String },
    Inline(InlineModule),
}
