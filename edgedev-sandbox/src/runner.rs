//! Module runner
//!
//! Imports modules into the sandbox by asking the host for runner-form code
//! and evaluating it through the eval binding. Every module is evaluated at
//! most once per runner; concurrent importers of the same id share a single
//! evaluation, and an import that closes a cycle receives the partially
//! initialized exports of the module still being evaluated.

use crate::channel::RpcError;
use crate::exports::{Exports, ExportsError};
use crate::vm::{wrapper_prefix, BindingSet, CompileUnit, ImportMeta, ModuleContext, VmError, CONTEXT_KEYS};
use edgedev_common::path::join_specifier;
use edgedev_common::{ExternalFetchResult, FetchModuleArgs, FetchModuleOptions, FetchResult, InlineFetchResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to fetch module '{id}': {source}")]
    Fetch {
        id: String,
        #[source]
        source: RpcError,
    },

    #[error("failed to evaluate module '{id}': {source}")]
    Evaluate {
        id: String,
        #[source]
        source: VmError,
    },

    #[error("failed to load external module '{id}': {source}")]
    External {
        id: String,
        #[source]
        source: VmError,
    },

    #[error("host answered '{0}' with a cache hit but the runner holds no copy")]
    UnexpectedCacheHit(String),

    #[error(transparent)]
    Exports(#[from] ExportsError),
}

/// What the runner knows about a module once its body has finished
#[derive(Debug, Clone)]
pub struct EvaluatedModule {
    pub file: Option<String>,
    /// Runner-form code, absent for externals
    pub code: Option<Arc<str>>,
    pub external: bool,
    /// Id of the record that was actually evaluated when a redirect landed
    /// on a module already imported under its own url
    pub shared_with: Option<String>,
}

/// One entry of the module graph
pub struct ModuleRecord {
    id: String,
    exports: Exports,
    state: OnceCell<EvaluatedModule>,
    /// Ids this module has imported so far, static and dynamic
    imports: Mutex<Vec<String>>,
}

impl ModuleRecord {
    fn new(id: String) -> Self {
        Self {
            id,
            exports: Exports::new(),
            state: OnceCell::new(),
            imports: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// `None` while the module is still being evaluated
    pub fn evaluated(&self) -> Option<&EvaluatedModule> {
        self.state.get()
    }

    pub fn is_evaluated(&self) -> bool {
        self.state.initialized()
    }

    pub fn imports(&self) -> Vec<String> {
        self.imports.lock().clone()
    }

    fn add_import(&self, id: &str) {
        let mut imports = self.imports.lock();
        if !imports.iter().any(|existing| existing == id) {
            imports.push(id.to_string());
        }
    }
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("id", &self.id)
            .field("evaluated", &self.is_evaluated())
            .field("exports", &self.exports)
            .finish()
    }
}

pub struct ModuleRunner {
    bindings: BindingSet,
    records: Mutex<HashMap<String, Arc<ModuleRecord>>>,
}

impl ModuleRunner {
    pub fn new(bindings: BindingSet) -> Arc<Self> {
        Arc::new(Self {
            bindings,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Import a top-level module, typically the worker entry
    pub async fn import(self: &Arc<Self>, id: &str) -> Result<Arc<ModuleRecord>, RunnerError> {
        self.import_from(id, None).await
    }

    /// Import `specifier` on behalf of `importer`.
    ///
    /// Relative specifiers are joined against the importer before the cache
    /// lookup, so `./a.js` from two directories never collides.
    pub(crate) async fn import_from(
        self: &Arc<Self>,
        specifier: &str,
        importer: Option<&str>,
    ) -> Result<Arc<ModuleRecord>, RunnerError> {
        let id = join_specifier(importer, specifier);
        let record = self.record(&id);

        if let Some(importer) = importer {
            // The edge must exist before we wait, so a concurrent evaluation
            // walking the graph can see it.
            self.record(importer).add_import(&id);
            if !record.is_evaluated() && self.reaches(&id, importer) {
                debug!(module_id = %id, importer, "Circular import, returning partial exports");
                return Ok(record);
            }
        }

        let runner = Arc::clone(self);
        let target = Arc::clone(&record);
        let importer = importer.map(str::to_string);
        record
            .state
            .get_or_try_init(|| async move {
                match runner.load(&target, importer.as_deref()).await {
                    Ok(evaluated) => Ok(evaluated),
                    Err(err) => {
                        target.exports.clear();
                        target.imports.lock().clear();
                        Err(err)
                    }
                }
            })
            .await?;

        // Importers of a redirected alias get the record that ran, so every
        // importer sees one exports object.
        let shared_with = record.evaluated().and_then(|e| e.shared_with.clone());
        if let Some(existing) = shared_with.and_then(|id| self.get(&id)) {
            return Ok(existing);
        }
        Ok(record)
    }

    /// Record for `id` if it has been imported
    pub fn get(&self, id: &str) -> Option<Arc<ModuleRecord>> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Forget every module so the next import fetches fresh code
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn record(&self, id: &str) -> Arc<ModuleRecord> {
        self.records
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ModuleRecord::new(id.to_string())))
            .clone()
    }

    /// Whether `to` is reachable from `from` over recorded import edges.
    /// Records are compared by identity since one record may sit under
    /// several ids.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let records = self.records.lock();
        let Some(target) = records.get(to).cloned() else {
            return false;
        };
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            let Some(record) = records.get(&id) else {
                continue;
            };
            if Arc::ptr_eq(record, &target) {
                return true;
            }
            if !seen.insert(Arc::as_ptr(record)) {
                continue;
            }
            stack.extend(record.imports.lock().iter().cloned());
        }
        false
    }

    async fn load(
        self: &Arc<Self>,
        record: &Arc<ModuleRecord>,
        importer: Option<&str>,
    ) -> Result<EvaluatedModule, RunnerError> {
        let mut args = FetchModuleArgs::new(record.id()).with_options(FetchModuleOptions {
            cached: false,
            start_offset: Some(wrapper_prefix().len()),
        });
        if let Some(importer) = importer {
            args = args.with_importer(importer);
        }

        debug!(module_id = %record.id(), importer = ?importer, "Fetching module");
        let result = self
            .bindings
            .fetch_module
            .fetch_module(args)
            .await
            .map_err(|source| RunnerError::Fetch {
                id: record.id().to_string(),
                source,
            })?;

        match result {
            FetchResult::Inline(inline) => self.run_inlined_module(record, inline).await,
            FetchResult::External(external) => self.run_external_module(record, external).await,
            FetchResult::Cached(_) => {
                warn!(module_id = %record.id(), "Host reported a cache hit for an unknown module");
                Err(RunnerError::UnexpectedCacheHit(record.id().to_string()))
            }
        }
    }

    async fn run_inlined_module(
        self: &Arc<Self>,
        record: &Arc<ModuleRecord>,
        inline: InlineFetchResult,
    ) -> Result<EvaluatedModule, RunnerError> {
        let file = inline.file.clone().unwrap_or_else(|| inline.id.clone());
        // A redirected module answers for its final url too; relative imports
        // inside it are joined against that url.
        let module_id = if inline.url.is_empty() {
            record.id().to_string()
        } else {
            inline.url.clone()
        };
        if module_id != record.id() {
            let existing = {
                let mut records = self.records.lock();
                let existing = records.entry(module_id.clone()).or_insert_with(|| Arc::clone(record));
                (!Arc::ptr_eq(existing, record)).then(|| Arc::clone(existing))
            };
            match existing {
                None => debug!(module_id = %record.id(), url = %module_id, "Aliasing redirected module"),
                Some(existing) => match existing.evaluated().cloned() {
                    Some(evaluated) => {
                        debug!(module_id = %record.id(), url = %module_id, "Redirect target already evaluated");
                        record.exports().assign_from(existing.exports())?;
                        record.exports().freeze();
                        return Ok(EvaluatedModule {
                            shared_with: Some(module_id),
                            ..evaluated
                        });
                    }
                    None => warn!(
                        module_id = %record.id(),
                        url = %module_id,
                        "Redirect target is still evaluating under its own id, evaluating a second copy"
                    ),
                },
            }
        }
        let unit = CompileUnit {
            source: format!("{}{}\n}}", wrapper_prefix(), inline.code),
            filename: file.clone(),
            parameters: CONTEXT_KEYS.to_vec(),
        };
        let context = ModuleContext::new(
            Arc::clone(self),
            module_id,
            record.exports().clone(),
            ImportMeta::for_file(&file),
        );

        info!(
            module_id = %record.id(),
            engine = self.bindings.eval.name(),
            code_len = inline.code.len(),
            "Evaluating module"
        );
        self.bindings
            .eval
            .evaluate(unit, context)
            .await
            .map_err(|source| RunnerError::Evaluate {
                id: record.id().to_string(),
                source,
            })?;
        record.exports().freeze();

        Ok(EvaluatedModule {
            file: Some(file),
            code: Some(Arc::from(inline.code)),
            external: false,
            shared_with: None,
        })
    }

    async fn run_external_module(
        self: &Arc<Self>,
        record: &Arc<ModuleRecord>,
        external: ExternalFetchResult,
    ) -> Result<EvaluatedModule, RunnerError> {
        debug!(module_id = %record.id(), path = %external.externalize, kind = ?external.kind, "Loading external module");
        self.bindings
            .eval
            .import_external(&external.externalize, record.exports())
            .await
            .map_err(|source| RunnerError::External {
                id: record.id().to_string(),
                source,
            })?;
        record.exports().freeze();

        Ok(EvaluatedModule {
            file: Some(external.externalize),
            code: None,
            external: true,
            shared_with: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{EvalBinding, FetchModuleBinding};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use edgedev_common::ExternalKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves modules from a table of `id -> code`. The code is a tiny
    /// line-based script understood by [`ScriptEngine`].
    struct TableHost {
        modules: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl TableHost {
        fn new(modules: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                modules: modules
                    .iter()
                    .map(|(id, code)| (id.to_string(), code.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FetchModuleBinding for TableHost {
        async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(args.options.start_offset, Some(wrapper_prefix().len()));
            if args.id.starts_with("node:") {
                return Ok(FetchResult::external(args.id, ExternalKind::Builtin));
            }
            match self.modules.get(&args.id) {
                Some(code) => Ok(FetchResult::inline(args.id.clone(), code.clone())),
                None => Err(RpcError::Remote(format!("no module {}", args.id))),
            }
        }
    }

    /// Interprets one statement per line:
    /// `import <specifier>`, `set <name> <json>`, `copy <name> <specifier>.<export>`,
    /// `sleep <ms>`, `throw`
    struct ScriptEngine;

    #[async_trait]
    impl EvalBinding for ScriptEngine {
        async fn evaluate(&self, unit: CompileUnit, context: ModuleContext) -> Result<(), VmError> {
            let body = unit
                .source
                .strip_prefix(&wrapper_prefix())
                .and_then(|rest| rest.strip_suffix("\n}"))
                .ok_or_else(|| VmError::Compile {
                    filename: unit.filename.clone(),
                    message: "not wrapped".into(),
                })?;
            for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let mut parts = line.splitn(3, ' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("import"), Some(specifier), None) => {
                        context.import(specifier).await?;
                    }
                    (Some("set"), Some(name), Some(value)) => {
                        let value: serde_json::Value = serde_json::from_str(value).map_err(|e| {
                            VmError::Compile {
                                filename: unit.filename.clone(),
                                message: e.to_string(),
                            }
                        })?;
                        context.exports().set(name, value)?;
                    }
                    (Some("copy"), Some(name), Some(source)) => {
                        let (specifier, export) = source.rsplit_once('.').unwrap_or((source, "default"));
                        let ns = context.import(specifier).await?;
                        let value = ns
                            .get(export)
                            .unwrap_or_else(|| json!(null).into());
                        context.exports().set(name, value)?;
                    }
                    (Some("sleep"), Some(ms), None) => {
                        let ms: u64 = ms.parse().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    (Some("throw"), _, _) => {
                        return Err(VmError::Exception {
                            filename: unit.filename.clone(),
                            message: "boom".into(),
                        })
                    }
                    _ => {
                        return Err(VmError::Compile {
                            filename: unit.filename.clone(),
                            message: format!("bad line: {}", line),
                        })
                    }
                }
            }
            Ok(())
        }

        async fn import_external(&self, specifier: &str, exports: &Exports) -> Result<(), VmError> {
            exports.set("builtin", json!(specifier))?;
            Ok(())
        }

        fn name(&self) -> &str {
            "script"
        }
    }

    fn runner_for(host: Arc<TableHost>) -> Arc<ModuleRunner> {
        ModuleRunner::new(BindingSet::new(Arc::new(ScriptEngine), host))
    }

    #[tokio::test]
    async fn test_import_freezes_exports() {
        let host = TableHost::new(&[("/src/a.js", "set answer 42")]);
        let runner = runner_for(host);

        let record = runner.import("/src/a.js").await.unwrap();
        assert!(record.is_evaluated());
        assert!(record.exports().is_frozen());
        assert_eq!(record.exports().get("answer").unwrap().as_json(), Some(&json!(42)));
        assert_matches!(
            record.exports().set("answer", json!(1)),
            Err(ExportsError::Frozen(_))
        );
    }

    #[tokio::test]
    async fn test_relative_imports_resolve_against_importer() {
        let host = TableHost::new(&[
            ("/src/app.js", "copy value ./lib/util.js.value"),
            ("/src/lib/util.js", "set value \"util\""),
        ]);
        let runner = runner_for(host);

        let app = runner.import("/src/app.js").await.unwrap();
        assert_eq!(app.exports().get("value").unwrap().as_json(), Some(&json!("util")));
        assert!(runner.get("/src/lib/util.js").is_some());
        assert_eq!(app.imports(), vec!["/src/lib/util.js".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_imports_share_one_evaluation() {
        let host = TableHost::new(&[("/slow.js", "sleep 50\nset done true")]);
        let runner = runner_for(host.clone());

        let (a, b) = tokio::join!(runner.import("/slow.js"), runner.import("/slow.js"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);

        runner.import("/slow.js").await.unwrap();
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circular_import_sees_partial_exports() {
        let host = TableHost::new(&[
            ("/a.js", "set early 1\nimport /b.js\nset late 2"),
            ("/b.js", "copy seen /a.js.early\ncopy missing /a.js.late"),
        ]);
        let runner = runner_for(host);

        let a = runner.import("/a.js").await.unwrap();
        let b = runner.get("/b.js").unwrap();
        assert_eq!(b.exports().get("seen").unwrap().as_json(), Some(&json!(1)));
        assert_eq!(b.exports().get("missing").unwrap().as_json(), Some(&json!(null)));
        assert_eq!(a.exports().get("late").unwrap().as_json(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_entries_into_a_cycle_do_not_deadlock() {
        let host = TableHost::new(&[
            ("/a.js", "sleep 20\nimport /b.js\nset a 1"),
            ("/b.js", "sleep 20\nimport /a.js\nset b 1"),
        ]);
        let runner = runner_for(host);

        let joined = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join(runner.import("/a.js"), runner.import("/b.js")),
        )
        .await
        .expect("cycle deadlocked");
        assert!(joined.0.is_ok());
        assert!(joined.1.is_ok());
    }

    #[tokio::test]
    async fn test_failed_evaluation_can_be_retried() {
        let host = TableHost::new(&[("/bad.js", "set partial 1\nthrow")]);
        let runner = runner_for(host.clone());

        let err = runner.import("/bad.js").await.unwrap_err();
        assert_matches!(err, RunnerError::Evaluate { ref id, .. } if id == "/bad.js");
        let record = runner.get("/bad.js").unwrap();
        assert!(!record.is_evaluated());
        assert!(record.exports().is_empty());

        assert!(runner.import("/bad.js").await.is_err());
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_external_module_is_loaded_natively() {
        let host = TableHost::new(&[("/app.js", "copy fs node:fs.builtin")]);
        let runner = runner_for(host);

        let app = runner.import("/app.js").await.unwrap();
        assert_eq!(app.exports().get("fs").unwrap().as_json(), Some(&json!("node:fs")));
        let fs = runner.get("node:fs").unwrap();
        assert!(fs.evaluated().unwrap().external);
        assert!(fs.exports().is_frozen());
    }

    /// Serves `lodash/debounce` from its resolved file, as a host that
    /// followed a fallback redirect would
    struct RedirectHost(Arc<TableHost>);

    #[async_trait]
    impl FetchModuleBinding for RedirectHost {
        async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
            if args.id == "lodash/debounce" {
                let url = "/node_modules/lodash/debounce.js";
                return Ok(FetchResult::Inline(InlineFetchResult {
                    code: "copy wait ./wait.js.value".into(),
                    file: Some(url.into()),
                    id: url.into(),
                    url: url.into(),
                    invalidate: false,
                }));
            }
            self.0.fetch_module(args).await
        }
    }

    #[tokio::test]
    async fn test_redirected_module_imports_relative_to_its_url() {
        let table = TableHost::new(&[("/node_modules/lodash/wait.js", "set value 5")]);
        let runner = ModuleRunner::new(BindingSet::new(Arc::new(ScriptEngine), Arc::new(RedirectHost(table))));

        let debounce = runner.import("lodash/debounce").await.unwrap();
        assert_eq!(debounce.exports().get("wait").unwrap().as_json(), Some(&json!(5)));
        assert!(runner.get("/node_modules/lodash/wait.js").is_some());

        let alias = runner.get("/node_modules/lodash/debounce.js").unwrap();
        assert!(Arc::ptr_eq(&alias, &debounce));
        assert_eq!(debounce.imports(), vec!["/node_modules/lodash/wait.js".to_string()]);
    }

    #[tokio::test]
    async fn test_redirect_to_evaluated_module_reuses_it() {
        let table = TableHost::new(&[
            ("/node_modules/lodash/debounce.js", "copy wait ./wait.js.value"),
            ("/node_modules/lodash/wait.js", "set value 5"),
        ]);
        let runner = ModuleRunner::new(BindingSet::new(Arc::new(ScriptEngine), Arc::new(RedirectHost(table))));

        let direct = runner.import("/node_modules/lodash/debounce.js").await.unwrap();
        let debounce = runner.import("lodash/debounce").await.unwrap();
        assert!(Arc::ptr_eq(&direct, &debounce));
        assert!(Arc::ptr_eq(&runner.get("/node_modules/lodash/debounce.js").unwrap(), &direct));

        // The alias record never ran its body; it carries a frozen copy.
        let alias = runner.get("lodash/debounce").unwrap();
        assert!(!Arc::ptr_eq(&alias, &direct));
        assert!(alias.imports().is_empty());
        assert_eq!(alias.evaluated().unwrap().shared_with.as_deref(), Some("/node_modules/lodash/debounce.js"));
        assert_eq!(alias.exports().get("wait").unwrap().as_json(), Some(&json!(5)));
        assert!(alias.exports().is_frozen());
        assert_eq!(direct.imports(), vec!["/node_modules/lodash/wait.js".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_module_reports_fetch_error() {
        let runner = runner_for(TableHost::new(&[]));
        let err = runner.import("/nope.js").await.unwrap_err();
        assert_matches!(err, RunnerError::Fetch { source: RpcError::Remote(_), .. });
    }
}
