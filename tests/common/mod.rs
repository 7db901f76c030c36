//! Common test utilities shared across integration tests

use async_trait::async_trait;
use edgedev_common::{FetchModuleArgs, FetchRequest, FetchResponse, FetchResult};
use edgedev_resolver::{FallbackOptions, FallbackResolver, ModuleService};
use edgedev_sandbox::{
    CompileUnit, Env, EvalBinding, ExecutionContext, FetchHandler, FetchModuleBinding, ModuleContext, RpcError,
    VmError,
};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgedev=debug")
        .with_test_writer()
        .try_init();
}

pub fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// A small worker project: an entry with a relative import and a bare
/// CommonJS dependency, plus a module without a default export
pub fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "src/worker.ts",
        "import { greet } from \"./greet.ts\";\nimport debounce from \"lodash/debounce\";\n\nexport default {\n  fetch(request: Request) {\n    return new Response(greet(\"edge\"), { status: debounce ? 200 : 500 });\n  },\n};\n",
    );
    write(
        root,
        "src/greet.ts",
        "export const greet = (name: string): string => `hello ${name}`;\n",
    );
    write(root, "node_modules/lodash/package.json", r#"{"name":"lodash","main":"lodash.js"}"#);
    write(root, "node_modules/lodash/lodash.js", "module.exports = {};\n");
    write(
        root,
        "node_modules/lodash/debounce.js",
        "module.exports = function debounce(fn) { return fn; };\n",
    );
    dir
}

pub fn module_service(root: &Path) -> Arc<ModuleService> {
    let fallback = FallbackResolver::new(FallbackOptions {
        root: root.to_path_buf(),
        ..FallbackOptions::default()
    });
    Arc::new(ModuleService::new(Arc::new(fallback)).with_external(["react"]))
}

/// Stand-in script engine for runner-form modules.
///
/// It does not execute JavaScript: it awaits every hoisted
/// `__vite_ssr_import__` in order, defines each named export as `true`, and
/// installs an [`EntryHandler`] when the module assigns a default export.
pub struct ScanningEngine {
    imports: Regex,
    named: Regex,
}

impl ScanningEngine {
    pub fn new() -> Self {
        Self {
            imports: Regex::new(r#"await __vite_ssr_import__\("([^"]+)"\)"#).unwrap(),
            named: Regex::new(r#"Object\.defineProperty\(__vite_ssr_exports__, "([^"]+)""#).unwrap(),
        }
    }
}

impl Default for ScanningEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvalBinding for ScanningEngine {
    async fn evaluate(&self, unit: CompileUnit, context: ModuleContext) -> Result<(), VmError> {
        let specifiers: Vec<String> = self
            .imports
            .captures_iter(&unit.source)
            .map(|c| c[1].to_string())
            .collect();
        for specifier in specifiers {
            context.import(&specifier).await?;
        }
        for name in self.named.captures_iter(&unit.source) {
            context.exports().set(&name[1], serde_json::Value::Bool(true))?;
        }
        if unit.source.contains("__vite_ssr_exports__.default =") {
            context.exports().set_handler(
                "default",
                Arc::new(EntryHandler {
                    module: context.id().to_string(),
                }),
            )?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "scanning"
    }
}

/// Fetch handler reporting which module served the request
pub struct EntryHandler {
    pub module: String,
}

#[async_trait]
impl FetchHandler for EntryHandler {
    async fn fetch(
        &self,
        request: FetchRequest,
        _env: &Env,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<FetchResponse> {
        Ok(FetchResponse::text(
            200,
            format!("{} {} via {}", request.method(), request.url().path(), self.module),
        ))
    }
}

/// Counts fetch-module calls per id before forwarding them
pub struct CountingBinding {
    inner: Arc<dyn FetchModuleBinding>,
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingBinding {
    pub fn new(inner: Arc<dyn FetchModuleBinding>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls.lock().get(id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl FetchModuleBinding for CountingBinding {
    async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
        *self.calls.lock().entry(args.id.clone()).or_insert(0) += 1;
        self.inner.fetch_module(args).await
    }
}
