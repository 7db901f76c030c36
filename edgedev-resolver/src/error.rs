use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("specifier is required")]
    MissingSpecifier,

    #[error("cannot find module '{specifier}' from '{from}'")]
    NotFound { specifier: String, from: String },

    #[error("package subpath '{subpath}' is not exported by '{package}'")]
    NotExported { package: String, subpath: String },

    #[error("'{0}' is a host builtin and cannot be resolved on disk")]
    Builtin(String),

    #[error("invalid package.json at {path}: {message}")]
    InvalidPackageJson { path: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Position of a diagnostic, 1-based
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{location}: {message}")]
    Syntax { location: Location, message: String },

    #[error("{location}: {construct} is not supported without a bundler that emits runtime code for it")]
    Unsupported { location: Location, construct: String },

    #[error("cannot resolve '{specifier}' imported by {importer}: {source}")]
    Dependency {
        specifier: String,
        importer: String,
        #[source]
        source: ResolveError,
    },

    #[error("esbuild failed to build {file}{}: {stderr}", .location.as_ref().map(|l| format!(" ({})", l)).unwrap_or_default())]
    Esbuild {
        file: String,
        location: Option<Location>,
        stderr: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load the grammar: {0}")]
    Grammar(String),

    #[error("bundler task failed: {0}")]
    Task(String),
}

impl TransformError {
    pub fn location(&self) -> Option<&Location> {
        match self {
            TransformError::Syntax { location, .. } | TransformError::Unsupported { location, .. } => Some(location),
            TransformError::Esbuild { location, .. } => location.as_ref(),
            _ => None,
        }
    }
}
