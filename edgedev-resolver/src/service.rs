//! Host side of the fetch-module binding

use crate::fallback::FallbackResolver;
use crate::normalize::root_path;
use crate::transform::ssr_transform;
use async_trait::async_trait;
use edgedev_common::path::package_name;
use edgedev_common::{
    ExternalKind, FallbackQuery, FetchModuleArgs, FetchResult, InlineFetchResult, ResolverResult,
};
use edgedev_sandbox::{FetchModuleBinding, RpcError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Redirect hops followed for one module before giving up
pub const MAX_REDIRECTS: usize = 8;

/// The dev server's own transform pipeline. It sees every id before the
/// fallback resolver does.
#[async_trait]
pub trait ModulePipeline: Send + Sync {
    /// `Ok(None)` hands the id on to the fallback resolver
    async fn fetch_module(&self, args: &FetchModuleArgs) -> Result<Option<FetchResult>, RpcError>;
}

pub struct ModuleService {
    fallback: Arc<FallbackResolver>,
    pipeline: Option<Arc<dyn ModulePipeline>>,
    external: BTreeSet<String>,
}

impl ModuleService {
    pub fn new(fallback: Arc<FallbackResolver>) -> Self {
        Self {
            fallback,
            pipeline: None,
            external: BTreeSet::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn ModulePipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Packages loaded through the sandbox's native import instead of the
    /// module runner
    pub fn with_external<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn fallback(&self) -> &FallbackResolver {
        &self.fallback
    }

    fn externalize(&self, id: &str) -> Option<FetchResult> {
        if id.starts_with("node:") {
            return Some(FetchResult::external(id, ExternalKind::Builtin));
        }
        if id.starts_with("data:") || id.starts_with("http://") || id.starts_with("https://") {
            return Some(FetchResult::external(id, ExternalKind::Network));
        }
        match package_name(id) {
            Some(name) if self.external.contains(name) => Some(FetchResult::external(id, ExternalKind::Module)),
            _ => None,
        }
    }

    pub async fn fetch(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
        if let Some(result) = self.externalize(&args.id) {
            debug!(module_id = %args.id, "Externalized module");
            return Ok(result);
        }
        if let Some(pipeline) = &self.pipeline {
            if let Some(result) = pipeline.fetch_module(&args).await? {
                return Ok(result);
            }
        }

        let mut query = FallbackQuery::new(args.id.clone());
        if let Some(importer) = &args.importer {
            query = query.with_referrer(importer.clone());
        }
        for hop in 0..=MAX_REDIRECTS {
            let url = query.specifier.clone().unwrap_or_default();
            match self.fallback.resolve(&query).await {
                Ok(ResolverResult::Redirect { location }) => {
                    debug!(module_id = %args.id, hop, location = %location, "Following fallback redirect");
                    let mut next = FallbackQuery::new(location).with_method(query.method);
                    next.referrer = query.referrer.take();
                    query = next;
                }
                Ok(ResolverResult::Inline(module)) => {
                    let code = ssr_transform(&module.es_module, &url).map_err(|e| RpcError::Remote(e.to_string()))?;
                    let file = root_path(self.fallback.root(), &module.name);
                    return Ok(FetchResult::Inline(InlineFetchResult {
                        code,
                        file: Some(file.display().to_string()),
                        id: url.clone(),
                        url,
                        invalidate: false,
                    }));
                }
                Err(err) => {
                    warn!(module_id = %args.id, importer = ?args.importer, error = %err, "Module fallback failed");
                    return Err(RpcError::Remote(err.to_string()));
                }
            }
        }
        Err(RpcError::Remote(format!(
            "too many redirects while resolving '{}' (limit {})",
            args.id, MAX_REDIRECTS
        )))
    }

    /// JSON form of one call: `[moduleId, importerId, options]` in, a
    /// `FetchResult` out
    pub async fn handle_json(&self, body: Value) -> Result<Value, RpcError> {
        let args: FetchModuleArgs = serde_json::from_value(body)?;
        let result = self.fetch(args).await?;
        Ok(serde_json::to_value(result)?)
    }
}

#[async_trait]
impl FetchModuleBinding for ModuleService {
    async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
        self.fetch(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackOptions;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn service() -> (TempDir, ModuleService) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/util.js", "import { x } from \"./x.js\";\nexport const y = x + 1;\n");
        write(root, "node_modules/lodash/package.json", r#"{"name":"lodash","main":"lodash.js"}"#);
        write(root, "node_modules/lodash/debounce.js", "module.exports = function debounce() {};\n");

        let fallback = FallbackResolver::new(FallbackOptions {
            root: root.to_path_buf(),
            ..FallbackOptions::default()
        });
        let service = ModuleService::new(Arc::new(fallback)).with_external(["react"]);
        (dir, service)
    }

    #[tokio::test]
    async fn test_externals() {
        let (_dir, service) = service();
        assert_eq!(
            service.fetch(FetchModuleArgs::new("node:fs")).await.unwrap(),
            FetchResult::external("node:fs", ExternalKind::Builtin)
        );
        assert_eq!(
            service.fetch(FetchModuleArgs::new("react/jsx-runtime")).await.unwrap(),
            FetchResult::external("react/jsx-runtime", ExternalKind::Module)
        );
        assert_eq!(
            service.fetch(FetchModuleArgs::new("https://esm.sh/x")).await.unwrap(),
            FetchResult::external("https://esm.sh/x", ExternalKind::Network)
        );
    }

    #[tokio::test]
    async fn test_follows_redirect_to_inline_module() {
        let (_dir, service) = service();
        let result = service
            .fetch(FetchModuleArgs::new("lodash/debounce").with_importer("/src/app.ts"))
            .await
            .unwrap();
        let FetchResult::Inline(inline) = result else {
            panic!("expected inline module, got {:?}", result);
        };
        assert_eq!(inline.id, "/node_modules/lodash/debounce.js");
        assert_eq!(inline.url, "/node_modules/lodash/debounce.js");
        assert!(Path::new(inline.file.as_deref().unwrap()).ends_with("node_modules/lodash/debounce.js"));
        assert!(inline.code.contains("__vite_ssr_exports__.default = module.exports;"));
        assert!(!inline.code.contains("export default"));
    }

    #[tokio::test]
    async fn test_inline_esm_is_runner_form() {
        let (_dir, service) = service();
        let result = service.fetch(FetchModuleArgs::new("/src/util.js")).await.unwrap();
        let FetchResult::Inline(inline) = result else {
            panic!("expected inline module, got {:?}", result);
        };
        assert!(inline
            .code
            .contains(r#"const __vite_ssr_import_0__ = await __vite_ssr_import__("./x.js");"#));
        assert!(inline.code.contains("const y = __vite_ssr_import_0__.x + 1;"));
        assert!(inline.code.contains(r#"Object.defineProperty(__vite_ssr_exports__, "y""#));
    }

    struct AppPipeline;

    #[async_trait]
    impl ModulePipeline for AppPipeline {
        async fn fetch_module(&self, args: &FetchModuleArgs) -> Result<Option<FetchResult>, RpcError> {
            if args.id == "/src/app.ts" {
                return Ok(Some(FetchResult::inline("/src/app.ts", "/* app */")));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_pipeline_gets_first_refusal() {
        let (_dir, service) = service();
        let service = service.with_pipeline(Arc::new(AppPipeline));
        assert_eq!(
            service.fetch(FetchModuleArgs::new("/src/app.ts")).await.unwrap(),
            FetchResult::inline("/src/app.ts", "/* app */")
        );
        assert_matches!(
            service.fetch(FetchModuleArgs::new("/src/util.js")).await.unwrap(),
            FetchResult::Inline(ref inline) if inline.url == "/src/util.js"
        );
    }

    #[tokio::test]
    async fn test_missing_module_is_remote_error() {
        let (_dir, service) = service();
        let err = service.fetch(FetchModuleArgs::new("left-pad")).await.unwrap_err();
        assert_matches!(err, RpcError::Remote(ref message) if message.contains("left-pad"));
    }

    #[tokio::test]
    async fn test_json_wire_form() {
        let (_dir, service) = service();
        let reply = service.handle_json(json!(["node:path", null, {}])).await.unwrap();
        assert_eq!(reply, json!({"externalize": "node:path", "type": "builtin"}));

        let err = service.handle_json(json!({"id": 1})).await.unwrap_err();
        assert_matches!(err, RpcError::Serialization(_));
    }
}
