//! Node-style package resolution
//!
//! One resolver serves both module conventions. The method picks the
//! condition set used for `package.json` `exports`; an explicit condition
//! list (the sandbox-compatible one used while bundling) overrides it.

use crate::error::ResolveError;
use edgedev_common::path::{is_bare_specifier, package_name};
use edgedev_common::ResolveMethod;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

pub const IMPORT_CONDITIONS: [&str; 3] = ["import", "node", "default"];
pub const REQUIRE_CONDITIONS: [&str; 3] = ["require", "node", "default"];

const DEFAULT_EXTENSIONS: [&str; 8] = [".js", ".mjs", ".cjs", ".ts", ".mts", ".tsx", ".jsx", ".json"];

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Replaces the per-method condition set when present
    pub conditions: Option<Vec<String>>,
    /// `package.json` fields consulted, in order, when a package has no
    /// `exports`
    pub main_fields: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            conditions: None,
            main_fields: vec!["main".to_string()],
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PackageResolver {
    options: ResolveOptions,
}

impl PackageResolver {
    pub fn new(options: ResolveOptions) -> Self {
        Self { options }
    }

    /// Resolver with a fixed condition set and main-field order
    pub fn with_conditions(conditions: Vec<String>, main_fields: Vec<String>) -> Self {
        Self::new(ResolveOptions {
            conditions: Some(conditions),
            main_fields,
            ..ResolveOptions::default()
        })
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    pub fn conditions(&self, method: ResolveMethod) -> Vec<String> {
        if let Some(conditions) = &self.options.conditions {
            return conditions.clone();
        }
        let set = match method {
            ResolveMethod::Import => IMPORT_CONDITIONS,
            ResolveMethod::Require => REQUIRE_CONDITIONS,
        };
        set.iter().map(|c| c.to_string()).collect()
    }

    /// Resolve `specifier` as imported from a file inside `from_dir`
    pub fn resolve(&self, specifier: &str, from_dir: &Path, method: ResolveMethod) -> Result<PathBuf, ResolveError> {
        if specifier.starts_with("node:") {
            return Err(ResolveError::Builtin(specifier.to_string()));
        }
        let not_found = || ResolveError::NotFound {
            specifier: specifier.to_string(),
            from: from_dir.display().to_string(),
        };

        if !is_bare_specifier(specifier) {
            let base = if specifier.starts_with('/') {
                PathBuf::from(specifier)
            } else {
                from_dir.join(specifier)
            };
            return self.resolve_path(&base).ok_or_else(not_found);
        }

        let name = package_name(specifier).ok_or_else(not_found)?;
        let subpath = match &specifier[name.len()..] {
            "" => ".".to_string(),
            rest => format!(".{}", rest),
        };
        let conditions = self.conditions(method);

        for dir in from_dir.ancestors() {
            let package_dir = dir.join("node_modules").join(name);
            if package_dir.is_dir() {
                trace!(specifier, package_dir = %package_dir.display(), "Found package");
                return self.resolve_in_package(&package_dir, name, &subpath, &conditions, specifier, from_dir);
            }
        }
        Err(not_found())
    }

    /// Probe `path` as a file, with each extension appended, then as a
    /// directory
    pub fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        for ext in &self.options.extensions {
            let candidate = append_extension(path, ext);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if path.is_dir() {
            if let Ok(Some(manifest)) = read_manifest(path) {
                if let Some(found) = self.resolve_main(path, &manifest) {
                    return Some(found);
                }
            }
            return self.resolve_index(path);
        }
        None
    }

    fn resolve_index(&self, dir: &Path) -> Option<PathBuf> {
        self.options
            .extensions
            .iter()
            .map(|ext| dir.join(format!("index{}", ext)))
            .find(|candidate| candidate.is_file())
    }

    fn resolve_main(&self, package_dir: &Path, manifest: &Value) -> Option<PathBuf> {
        self.options
            .main_fields
            .iter()
            .filter_map(|field| manifest.get(field).and_then(Value::as_str))
            .find_map(|main| {
                let target = package_dir.join(main);
                if target.is_file() {
                    return Some(target);
                }
                self.options
                    .extensions
                    .iter()
                    .map(|ext| append_extension(&target, ext))
                    .find(|candidate| candidate.is_file())
                    .or_else(|| if target.is_dir() { self.resolve_index(&target) } else { None })
            })
    }

    fn resolve_in_package(
        &self,
        package_dir: &Path,
        name: &str,
        subpath: &str,
        conditions: &[String],
        specifier: &str,
        from_dir: &Path,
    ) -> Result<PathBuf, ResolveError> {
        let not_found = || ResolveError::NotFound {
            specifier: specifier.to_string(),
            from: from_dir.display().to_string(),
        };
        let manifest = read_manifest(package_dir)?;

        if let Some(exports) = manifest.as_ref().and_then(|m| m.get("exports")) {
            let target = resolve_exports(exports, subpath, conditions).ok_or_else(|| ResolveError::NotExported {
                package: name.to_string(),
                subpath: subpath.to_string(),
            })?;
            let path = package_dir.join(target.trim_start_matches("./"));
            return if path.is_file() { Ok(path) } else { Err(not_found()) };
        }

        if subpath == "." {
            if let Some(found) = manifest.as_ref().and_then(|m| self.resolve_main(package_dir, m)) {
                return Ok(found);
            }
            return self.resolve_index(package_dir).ok_or_else(not_found);
        }
        self.resolve_path(&package_dir.join(subpath.trim_start_matches("./")))
            .ok_or_else(not_found)
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(ext);
    PathBuf::from(raw)
}

fn read_manifest(package_dir: &Path) -> Result<Option<Value>, ResolveError> {
    let path = package_dir.join("package.json");
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| ResolveError::InvalidPackageJson {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// Match `subpath` (`.` or `./x`) against an `exports` field
pub fn resolve_exports(exports: &Value, subpath: &str, conditions: &[String]) -> Option<String> {
    let is_subpath_map = exports
        .as_object()
        .map(|map| map.keys().any(|k| k.starts_with('.')))
        .unwrap_or(false);

    if !is_subpath_map {
        // String, array and condition-object sugar all mean `{".": exports}`
        return if subpath == "." {
            resolve_target(exports, conditions, None)
        } else {
            None
        };
    }

    let map = exports.as_object()?;
    if let Some(target) = map.get(subpath) {
        if !subpath.contains('*') {
            return resolve_target(target, conditions, None);
        }
    }

    // Longest matching key wins
    let mut best: Option<(&str, &Value, SubpathMatch)> = None;
    for (key, target) in map {
        let matched = if let Some((prefix, suffix)) = key.split_once('*') {
            subpath
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .map(|star| SubpathMatch::Pattern(star.to_string()))
        } else if key.ends_with('/') {
            subpath
                .strip_prefix(key.as_str())
                .map(|rest| SubpathMatch::Folder(rest.to_string()))
        } else {
            None
        };
        if let Some(matched) = matched {
            if best.as_ref().map_or(true, |(k, _, _)| key.len() > k.len()) {
                best = Some((key, target, matched));
            }
        }
    }

    match best? {
        (_, target, SubpathMatch::Pattern(star)) => resolve_target(target, conditions, Some(&star)),
        (_, target, SubpathMatch::Folder(rest)) => {
            resolve_target(target, conditions, None).map(|dir| format!("{}{}", dir, rest))
        }
    }
}

enum SubpathMatch {
    /// `./x/*` keys; holds the text matched by `*`
    Pattern(String),
    /// Legacy `./x/` keys; holds the remainder after the folder
    Folder(String),
}

fn resolve_target(target: &Value, conditions: &[String], star: Option<&str>) -> Option<String> {
    match target {
        Value::String(path) => Some(match star {
            Some(star) => path.replace('*', star),
            None => path.clone(),
        }),
        Value::Array(candidates) => candidates
            .iter()
            .find_map(|candidate| resolve_target(candidate, conditions, star)),
        Value::Object(branches) => branches.iter().find_map(|(condition, branch)| {
            if condition == "default" || conditions.iter().any(|c| c == condition) {
                resolve_target(branch, conditions, star)
            } else {
                None
            }
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/app.ts", "export {}");
        write(root, "node_modules/lodash/package.json", r#"{"name":"lodash","main":"lodash.js"}"#);
        write(root, "node_modules/lodash/lodash.js", "module.exports = {}");
        write(root, "node_modules/lodash/debounce.js", "module.exports = function () {}");
        write(
            root,
            "node_modules/dual/package.json",
            r#"{
                "name": "dual",
                "exports": {
                    ".": {
                        "types": "./index.d.ts",
                        "import": "./esm/index.mjs",
                        "require": "./cjs/index.cjs"
                    },
                    "./features/*": "./dist/features/*.js",
                    "./package.json": "./package.json"
                }
            }"#,
        );
        write(root, "node_modules/dual/esm/index.mjs", "export default 1");
        write(root, "node_modules/dual/cjs/index.cjs", "module.exports = 1");
        write(root, "node_modules/dual/dist/features/a.js", "export const a = 1");
        dir
    }

    #[test]
    fn test_bare_subpath_without_exports() {
        let dir = fixture();
        let resolver = PackageResolver::default();
        let resolved = resolver
            .resolve("lodash/debounce", &dir.path().join("src"), ResolveMethod::Import)
            .unwrap();
        assert_eq!(resolved, dir.path().join("node_modules/lodash/debounce.js"));

        let main = resolver
            .resolve("lodash", &dir.path().join("src"), ResolveMethod::Require)
            .unwrap();
        assert_eq!(main, dir.path().join("node_modules/lodash/lodash.js"));
    }

    #[test]
    fn test_method_selects_condition() {
        let dir = fixture();
        let resolver = PackageResolver::default();
        let from = dir.path().join("src");
        assert_eq!(
            resolver.resolve("dual", &from, ResolveMethod::Import).unwrap(),
            dir.path().join("node_modules/dual/esm/index.mjs")
        );
        assert_eq!(
            resolver.resolve("dual", &from, ResolveMethod::Require).unwrap(),
            dir.path().join("node_modules/dual/cjs/index.cjs")
        );
    }

    #[test]
    fn test_exports_patterns_and_encapsulation() {
        let dir = fixture();
        let resolver = PackageResolver::default();
        let from = dir.path().join("src");
        assert_eq!(
            resolver.resolve("dual/features/a", &from, ResolveMethod::Import).unwrap(),
            dir.path().join("node_modules/dual/dist/features/a.js")
        );
        assert_matches!(
            resolver.resolve("dual/esm/index.mjs", &from, ResolveMethod::Import),
            Err(ResolveError::NotExported { .. })
        );
    }

    #[test]
    fn test_relative_with_extension_probing() {
        let dir = fixture();
        let resolver = PackageResolver::default();
        assert_eq!(
            resolver.resolve("./app", &dir.path().join("src"), ResolveMethod::Import).unwrap(),
            dir.path().join("src/app.ts")
        );
        assert_matches!(
            resolver.resolve("./missing", &dir.path().join("src"), ResolveMethod::Import),
            Err(ResolveError::NotFound { .. })
        );
        assert_matches!(
            resolver.resolve("node:fs", dir.path(), ResolveMethod::Import),
            Err(ResolveError::Builtin(_))
        );
    }

    #[test]
    fn test_explicit_conditions_override_method() {
        let exports = json!({
            ".": {"workerd": "./worker.js", "node": "./node.js", "default": "./index.js"}
        });
        let conditions = vec!["workerd".to_string(), "import".to_string()];
        assert_eq!(resolve_exports(&exports, ".", &conditions).as_deref(), Some("./worker.js"));
        let node: Vec<String> = IMPORT_CONDITIONS.iter().map(|c| c.to_string()).collect();
        assert_eq!(resolve_exports(&exports, ".", &node).as_deref(), Some("./node.js"));
    }

    #[test]
    fn test_sugar_exports() {
        let conditions: Vec<String> = vec!["import".into()];
        assert_eq!(resolve_exports(&json!("./main.js"), ".", &conditions).as_deref(), Some("./main.js"));
        assert_eq!(resolve_exports(&json!("./main.js"), "./x", &conditions), None);
        assert_eq!(
            resolve_exports(&json!({"import": "./m.mjs", "default": "./m.js"}), ".", &conditions).as_deref(),
            Some("./m.mjs")
        );
    }
}
