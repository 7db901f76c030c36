//! VM abstraction
//!
//! The sandbox sees the host through exactly two capabilities: an eval
//! binding that compiles and runs a code string with named context
//! arguments, and a fetch-module binding that asks the host for a module.

use crate::channel::RpcError;
use crate::exports::{Exports, ExportsError};
use crate::runner::{ModuleRunner, RunnerError};
use async_trait::async_trait;
use edgedev_common::path::dirname;
use edgedev_common::{FetchModuleArgs, FetchResult};
use std::sync::Arc;
use thiserror::Error;

pub const SSR_IMPORT_KEY: &str = "__vite_ssr_import__";
pub const SSR_DYNAMIC_IMPORT_KEY: &str = "__vite_ssr_dynamic_import__";
pub const SSR_EXPORTS_KEY: &str = "__vite_ssr_exports__";
pub const SSR_EXPORT_ALL_KEY: &str = "__vite_ssr_exportAll__";
pub const SSR_IMPORT_META_KEY: &str = "__vite_ssr_import_meta__";

/// Parameter names of every wrapped module body, in call order
pub const CONTEXT_KEYS: [&str; 5] = [
    SSR_IMPORT_KEY,
    SSR_DYNAMIC_IMPORT_KEY,
    SSR_EXPORTS_KEY,
    SSR_EXPORT_ALL_KEY,
    SSR_IMPORT_META_KEY,
];

/// `'use strict';async (k1,k2,...)=>{`
pub fn wrapper_prefix() -> String {
    format!("'use strict';async ({})=>{{", CONTEXT_KEYS.join(","))
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to compile {filename}: {message}")]
    Compile { filename: String, message: String },

    #[error("uncaught exception in {filename}: {message}")]
    Exception { filename: String, message: String },

    #[error("native import of '{0}' is not supported by this engine")]
    ExternalUnsupported(String),

    #[error("failed to start script engine: {0}")]
    Startup(String),

    #[error("script engine has stopped")]
    Stopped,

    #[error("malformed reply from script engine: {0}")]
    Protocol(String),

    #[error(transparent)]
    Import(Box<RunnerError>),

    #[error(transparent)]
    Exports(#[from] ExportsError),
}

impl From<RunnerError> for VmError {
    fn from(err: RunnerError) -> Self {
        VmError::Import(Box::new(err))
    }
}

/// A code string to compile, tagged with the module id so stack traces point
/// at the right file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnit {
    pub source: String,
    pub filename: String,
    /// Names the compiled function is invoked with, matching the context
    pub parameters: Vec<&'static str>,
}

/// `import.meta` of one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportMeta {
    pub url: String,
    pub filename: String,
    pub dirname: String,
}

impl ImportMeta {
    pub fn for_file(file: &str) -> Self {
        let url = if file.starts_with('/') {
            format!("file://{}", file)
        } else {
            file.to_string()
        };
        Self {
            url,
            filename: file.to_string(),
            dirname: dirname(file).to_string(),
        }
    }
}

/// The values bound to the context keys while a module body runs
#[derive(Clone)]
pub struct ModuleContext {
    runner: Arc<ModuleRunner>,
    id: String,
    exports: Exports,
    import_meta: ImportMeta,
}

impl ModuleContext {
    pub(crate) fn new(runner: Arc<ModuleRunner>, id: String, exports: Exports, import_meta: ImportMeta) -> Self {
        Self {
            runner,
            id,
            exports,
            import_meta,
        }
    }

    pub fn keys(&self) -> &'static [&'static str] {
        &CONTEXT_KEYS
    }

    /// Id of the module this context belongs to
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `__vite_ssr_exports__`
    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// `__vite_ssr_import_meta__`
    pub fn import_meta(&self) -> &ImportMeta {
        &self.import_meta
    }

    /// `__vite_ssr_import__`: static import of a dependency
    pub async fn import(&self, specifier: &str) -> Result<Exports, RunnerError> {
        let record = self.runner.import_from(specifier, Some(&self.id)).await?;
        Ok(record.exports().clone())
    }

    /// `__vite_ssr_dynamic_import__`
    ///
    /// Shares the module graph with static imports; the edge is still recorded
    /// so a dynamic import awaited at top level cannot deadlock a cycle.
    pub async fn dynamic_import(&self, specifier: &str) -> Result<Exports, RunnerError> {
        self.import(specifier).await
    }

    /// `__vite_ssr_exportAll__`
    pub fn export_all(&self, source: &Exports) -> Result<(), ExportsError> {
        self.exports.export_all_from(source)
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("id", &self.id)
            .field("import_meta", &self.import_meta)
            .finish_non_exhaustive()
    }
}

/// Compiles and runs code inside the sandbox
#[async_trait]
pub trait EvalBinding: Send + Sync {
    /// Compile `unit` as a function taking `unit.parameters`, call it with the
    /// matching values from `context` and wait for the returned promise.
    async fn evaluate(&self, unit: CompileUnit, context: ModuleContext) -> Result<(), VmError>;

    /// Load a module through the engine's own import, bypassing the runner,
    /// and fill `exports` with its namespace
    async fn import_external(&self, specifier: &str, _exports: &Exports) -> Result<(), VmError> {
        Err(VmError::ExternalUnsupported(specifier.to_string()))
    }

    /// Release the engine. Called once by the owning host on shutdown.
    fn close(&self) {}

    fn name(&self) -> &str;
}

/// Forwards a module request to the host transform pipeline
#[async_trait]
pub trait FetchModuleBinding: Send + Sync {
    async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError>;
}

/// The two capabilities injected into a sandbox instance
#[derive(Clone)]
pub struct BindingSet {
    pub eval: Arc<dyn EvalBinding>,
    pub fetch_module: Arc<dyn FetchModuleBinding>,
}

impl BindingSet {
    pub fn new(eval: Arc<dyn EvalBinding>, fetch_module: Arc<dyn FetchModuleBinding>) -> Self {
        Self { eval, fetch_module }
    }
}
