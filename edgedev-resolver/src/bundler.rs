//! Fallback bundlers
//!
//! A bundler turns one file on disk into a single ES module the sandbox can
//! import without further resolution. Dependencies stay external imports
//! unless their package is on the inline allow-list; inlined modules are
//! emitted as a registry of runner-form closures evaluated on first use.

use crate::error::TransformError;
use crate::node_resolve::PackageResolver;
use crate::normalize::location_for;
use crate::transform::{
    analyze, is_bindable, is_identifier, js_string, member_access, ssr_transform, strip_types, wrap_commonjs,
    wrap_commonjs_runner, Dialect, Edits, ImportBinding, ImportKind, ModuleAnalysis, ModuleFormat, ReExport,
};
use async_trait::async_trait;
use edgedev_common::path::{is_bare_specifier, is_relative_specifier, package_name};
use edgedev_common::ResolveMethod;
use edgedev_sandbox::CONTEXT_KEYS;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Conditions a workerd-style sandbox can satisfy
pub const SANDBOX_CONDITIONS: [&str; 4] = ["workerd", "worker", "webworker", "import"];
pub const SANDBOX_MAIN_FIELDS: [&str; 3] = ["module", "browser", "main"];
pub const DEFAULT_INLINE_PACKAGES: [&str; 1] = ["@remix-run/react"];

#[derive(Debug, Clone)]
pub struct BundleRequest {
    /// File to bundle, already known to exist
    pub entry: PathBuf,
    /// Modules root; registry keys are relative to it
    pub root: PathBuf,
    /// Specifier as written by the importer
    pub raw_specifier: String,
}

#[async_trait]
pub trait ModuleBundler: Send + Sync {
    /// Produce the ES module text for `request.entry`
    async fn bundle(&self, request: BundleRequest) -> Result<String, TransformError>;

    fn name(&self) -> &'static str;
}

/// Packages whose code is inlined into fallback modules. Matching is on the
/// exact package name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineAllowList {
    packages: BTreeSet<String>,
}

impl InlineAllowList {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// `name` or `name/subpath` of an allowed package
    pub fn allows_specifier(&self, specifier: &str) -> bool {
        package_name(specifier).is_some_and(|name| self.packages.contains(name))
    }

    /// A file inside the innermost `node_modules/<package>` of an allowed
    /// package
    pub fn allows_path(&self, path: &Path) -> bool {
        package_of_path(path).is_some_and(|name| self.packages.contains(&name))
    }
}

fn package_of_path(path: &Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let idx = parts.iter().rposition(|part| part == "node_modules")?;
    let first = parts.get(idx + 1)?;
    if first.starts_with('@') {
        Some(format!("{}/{}", first, parts.get(idx + 2)?))
    } else {
        Some(first.clone())
    }
}

struct LoadedModule {
    path: PathBuf,
    /// `/` + root-relative path
    key: String,
    /// JavaScript, with type syntax already stripped
    code: String,
    analysis: ModuleAnalysis,
}

impl LoadedModule {
    fn load(path: &Path, root: &Path) -> Result<Self, TransformError> {
        let source = fs::read_to_string(path).map_err(|source| TransformError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let key = location_for(root, path);

        let code = if path.extension().is_some_and(|ext| ext == "json") {
            format!("module.exports = {};", source.trim())
        } else {
            match Dialect::for_path(path) {
                Dialect::JavaScript => source,
                dialect => strip_types(&source, dialect, &key)?,
            }
        };
        let analysis = analyze(&code, Dialect::JavaScript, &key)?;
        Ok(Self {
            path: path.to_path_buf(),
            key,
            code,
            analysis,
        })
    }

    /// `const require` backed by a table of pre-imported modules. Emitted
    /// for every module so a `require` the analysis could not see still
    /// fails with a readable error.
    fn require_shim(&self, import_expr: impl Fn(&str) -> String) -> String {
        let mut seen = HashSet::new();
        let entries: Vec<String> = self
            .analysis
            .requires()
            .filter(|specifier| seen.insert(*specifier))
            .map(|specifier| format!("{}: {}", js_string(specifier), import_expr(specifier)))
            .collect();
        require_prelude(&entries)
    }
}

/// Declare `require` over `entries`, each a `"specifier": expression` pair
pub(crate) fn require_prelude(entries: &[String]) -> String {
    let table = if entries.is_empty() {
        "{}".to_string()
    } else {
        format!("{{ {} }}", entries.join(", "))
    };
    format!(
        "const __edgedev_required = {};\nconst require = (id) => __edgedev_interop(id, __edgedev_required);\n",
        table
    )
}

struct GraphModule {
    module: LoadedModule,
    /// specifier -> registry key of inlined dependencies
    deps: BTreeMap<String, String>,
}

/// Inlined modules, in discovery order
struct Graph<'r> {
    root: &'r Path,
    keys: HashMap<PathBuf, String>,
    queue: VecDeque<PathBuf>,
    modules: Vec<GraphModule>,
    by_key: HashMap<String, usize>,
}

impl<'r> Graph<'r> {
    fn new(root: &'r Path) -> Self {
        Self {
            root,
            keys: HashMap::new(),
            queue: VecDeque::new(),
            modules: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Registry key for `path`, queueing the file the first time it is seen
    fn key_for(&mut self, path: &Path) -> String {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Some(key) = self.keys.get(&path) {
            return key.clone();
        }
        let key = location_for(self.root, &path);
        self.keys.insert(path.clone(), key.clone());
        self.queue.push_back(path);
        key
    }

    fn push(&mut self, module: GraphModule) {
        self.by_key.insert(module.module.key.clone(), self.modules.len());
        self.modules.push(module);
    }

    fn get(&self, key: &str) -> Option<&GraphModule> {
        self.by_key.get(key).map(|idx| &self.modules[*idx])
    }

    /// Names reachable through `export *` of an inlined module
    fn star_names(&self, key: &str, seen: &mut HashSet<String>) -> Vec<String> {
        let Some(entry) = self.get(key) else {
            return Vec::new();
        };
        if !seen.insert(key.to_string()) {
            return Vec::new();
        }
        let analysis = &entry.module.analysis;
        if analysis.format == ModuleFormat::CommonJs {
            return analysis.commonjs_exports.clone();
        }
        let mut names: Vec<String> = analysis.exports.iter().filter(|n| *n != "default").cloned().collect();
        for import in &analysis.imports {
            if import.kind != ImportKind::ReExport(ReExport::All) {
                continue;
            }
            if let Some(dep) = entry.deps.get(&import.specifier) {
                for name in self.star_names(dep, seen) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }
}

const LOADER: &str = r#"const __edgedev_cache = Object.create(null);
function __edgedev_load(key) {
  const cached = __edgedev_cache[key];
  if (cached) return cached.done ? cached.promise : Promise.resolve(cached.exports);
  const record = __edgedev_registry[key];
  const exports = {};
  const state = { exports, done: false, promise: null };
  __edgedev_cache[key] = state;
  const load = (specifier) => (Object.hasOwn(record.deps, specifier) ? __edgedev_load(record.deps[specifier]) : import(specifier));
  const exportAll = (source) => {
    for (const name in source) {
      if (name !== "default" && !(name in exports)) {
        Object.defineProperty(exports, name, { enumerable: true, configurable: true, get: () => source[name] });
      }
    }
  };
  const slash = key.lastIndexOf("/");
  const meta = { url: "file://" + key, filename: key, dirname: slash > 0 ? key.slice(0, slash) : "/" };
  state.promise = record.init(load, load, exports, exportAll, meta).then(() => {
    state.done = true;
    return exports;
  });
  return state.promise;
}
"#;

/// `require` of an ES module yields its default export merged with its
/// named exports. A function default is wrapped so the named exports can be
/// attached without touching the original function.
pub(crate) const INTEROP: &str = r#"const __edgedev_interop_cache = new WeakMap();
function __edgedev_interop(id, table) {
  if (!Object.hasOwn(table, id)) {
    throw new Error("Cannot require \"" + id + "\": only statically known specifiers can be required");
  }
  const ns = table[id];
  const def = ns.default;
  if (typeof def !== "function") return { ...ns, ...def };
  const cached = __edgedev_interop_cache.get(ns);
  if (cached) return cached;
  const wrapped = function (...args) {
    return new.target ? Reflect.construct(def, args, new.target) : def.apply(this, args);
  };
  for (const source of [ns, def]) {
    for (const name of Object.keys(source)) {
      if (name === "prototype") continue;
      Object.defineProperty(wrapped, name, { value: source[name], enumerable: true, configurable: true, writable: true });
    }
  }
  __edgedev_interop_cache.set(ns, wrapped);
  return wrapped;
}
"#;

/// Tree-sitter based bundler
#[derive(Debug, Clone)]
pub struct NativeBundler {
    resolver: PackageResolver,
    allow: InlineAllowList,
}

impl NativeBundler {
    pub fn new(allow: InlineAllowList) -> Self {
        Self {
            resolver: PackageResolver::with_conditions(
                SANDBOX_CONDITIONS.iter().map(|c| c.to_string()).collect(),
                SANDBOX_MAIN_FIELDS.iter().map(|f| f.to_string()).collect(),
            ),
            allow,
        }
    }

    pub fn with_resolver(mut self, resolver: PackageResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn allow_list(&self) -> &InlineAllowList {
        &self.allow
    }

    fn should_inline(&self, specifier: &str, importer_inlined: bool) -> bool {
        if is_bare_specifier(specifier) {
            return self.allow.allows_specifier(specifier);
        }
        importer_inlined && (is_relative_specifier(specifier) || specifier.starts_with('/'))
    }

    fn resolve_deps(
        &self,
        module: &LoadedModule,
        importer_inlined: bool,
        graph: &mut Graph<'_>,
    ) -> Result<BTreeMap<String, String>, TransformError> {
        let from_dir = module.path.parent().unwrap_or(graph.root).to_path_buf();
        let mut deps = BTreeMap::new();
        for import in &module.analysis.imports {
            if deps.contains_key(&import.specifier) || !self.should_inline(&import.specifier, importer_inlined) {
                continue;
            }
            let method = match import.kind {
                ImportKind::Require => ResolveMethod::Require,
                _ => ResolveMethod::Import,
            };
            let path = self
                .resolver
                .resolve(&import.specifier, &from_dir, method)
                .map_err(|source| TransformError::Dependency {
                    specifier: import.specifier.clone(),
                    importer: module.key.clone(),
                    source,
                })?;
            deps.insert(import.specifier.clone(), graph.key_for(&path));
        }
        Ok(deps)
    }

    /// Synchronous bundling; file reads and parsing block
    pub fn bundle_blocking(&self, request: &BundleRequest) -> Result<String, TransformError> {
        let entry_inlined =
            self.allow.allows_specifier(&request.raw_specifier) || self.allow.allows_path(&request.entry);
        let entry = LoadedModule::load(&request.entry, &request.root)?;

        let mut graph = Graph::new(&request.root);
        let entry_deps = self.resolve_deps(&entry, entry_inlined, &mut graph)?;
        while let Some(path) = graph.queue.pop_front() {
            let module = LoadedModule::load(&path, &request.root)?;
            let deps = self.resolve_deps(&module, true, &mut graph)?;
            graph.push(GraphModule { module, deps });
        }
        debug!(
            entry = %entry.key,
            format = ?entry.analysis.format,
            inlined = graph.modules.len(),
            "Bundled fallback module"
        );

        let mut out = String::new();
        if !graph.modules.is_empty() {
            out.push_str(LOADER);
            out.push_str(&render_registry(&graph)?);
        }
        out.push_str(INTEROP);
        out.push_str(&entry.require_shim(|specifier| match entry_deps.get(specifier) {
            Some(key) => format!("await __edgedev_load({})", js_string(key)),
            None => format!("await import({})", js_string(specifier)),
        }));
        match entry.analysis.format {
            ModuleFormat::CommonJs => out.push_str(&wrap_commonjs(&entry.code, &entry.analysis.commonjs_exports)),
            ModuleFormat::Esm => out.push_str(&rewrite_entry(&entry, &entry_deps, &graph)),
        }
        Ok(out)
    }
}

#[async_trait]
impl ModuleBundler for NativeBundler {
    async fn bundle(&self, request: BundleRequest) -> Result<String, TransformError> {
        let bundler = self.clone();
        tokio::task::spawn_blocking(move || bundler.bundle_blocking(&request))
            .await
            .map_err(|e| TransformError::Task(e.to_string()))?
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

fn render_registry(graph: &Graph<'_>) -> Result<String, TransformError> {
    let mut out = String::from("const __edgedev_registry = {\n");
    for entry in &graph.modules {
        let module = &entry.module;
        let mut body =
            module.require_shim(|specifier| format!("await __vite_ssr_import__({})", js_string(specifier)));
        match module.analysis.format {
            ModuleFormat::Esm => body.push_str(&ssr_transform(&module.code, &module.key)?),
            ModuleFormat::CommonJs => body.push_str(&wrap_commonjs_runner(&module.code)),
        }
        let deps = serde_json::to_string(&entry.deps).map_err(|e| TransformError::Task(e.to_string()))?;
        out.push_str(&format!(
            "{}: {{ deps: {}, init: async ({}) => {{\n{}\n}} }},\n",
            js_string(&module.key),
            deps,
            CONTEXT_KEYS.join(", "),
            body
        ));
    }
    out.push_str("};\n");
    Ok(out)
}

fn export_name(name: &str) -> String {
    if is_identifier(name) {
        name.to_string()
    } else {
        js_string(name)
    }
}

/// Point the entry's imports of inlined modules at the registry
fn rewrite_entry(entry: &LoadedModule, deps: &BTreeMap<String, String>, graph: &Graph<'_>) -> String {
    let mut edits = Edits::new();
    for (idx, import) in entry.analysis.imports.iter().enumerate() {
        let Some(key) = deps.get(&import.specifier) else {
            continue;
        };
        let load = format!("__edgedev_load({})", js_string(key));
        let var = format!("__edgedev_m{}", idx);
        let replacement = match &import.kind {
            ImportKind::Require => continue,
            ImportKind::Dynamic => load,
            ImportKind::Static(bindings) => {
                let mut out = format!("const {} = await {};", var, load);
                for binding in bindings {
                    let (local, expr) = match binding {
                        ImportBinding::Default(local) => (local, format!("{}.default", var)),
                        ImportBinding::Namespace(local) => (local, var.clone()),
                        ImportBinding::Named { imported, local } => (local, member_access(&var, imported)),
                    };
                    out.push_str(&format!(" const {} = {};", local, expr));
                }
                out
            }
            ImportKind::ReExport(ReExport::All) => {
                let names: Vec<String> = graph
                    .star_names(key, &mut HashSet::new())
                    .into_iter()
                    .filter(|name| is_bindable(name) && !entry.analysis.exports.contains(name))
                    .collect();
                if names.is_empty() {
                    format!("await {};", load)
                } else {
                    format!(
                        "const {} = await {}; export const {{ {} }} = {};",
                        var,
                        load,
                        names.join(", "),
                        var
                    )
                }
            }
            ImportKind::ReExport(ReExport::Namespace(name)) => {
                format!("const {} = await {}; export {{ {} as {} }};", var, load, var, export_name(name))
            }
            ImportKind::ReExport(ReExport::Named(pairs)) => {
                let mut out = format!("const {} = await {};", var, load);
                let mut clause = Vec::new();
                for (i, (imported, exported)) in pairs.iter().enumerate() {
                    let local = format!("{}_{}", var, i);
                    out.push_str(&format!(" const {} = {};", local, member_access(&var, imported)));
                    clause.push(format!("{} as {}", local, export_name(exported)));
                }
                out.push_str(&format!(" export {{ {} }};", clause.join(", ")));
                out
            }
        };
        edits.replace(import.range.clone(), replacement);
    }
    edits.apply(&entry.code)
}
