//! Bundling through an external `esbuild` executable

use crate::bundler::{
    require_prelude, BundleRequest, InlineAllowList, ModuleBundler, INTEROP, SANDBOX_CONDITIONS, SANDBOX_MAIN_FIELDS,
};
use crate::error::{Location, TransformError};
use crate::transform::js_string;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EsbuildBundler {
    executable: PathBuf,
    allow: InlineAllowList,
    conditions: Vec<String>,
    main_fields: Vec<String>,
}

impl EsbuildBundler {
    pub fn new(allow: InlineAllowList) -> Self {
        Self {
            executable: PathBuf::from("esbuild"),
            allow,
            conditions: SANDBOX_CONDITIONS.iter().map(|c| c.to_string()).collect(),
            main_fields: SANDBOX_MAIN_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<String>, main_fields: Vec<String>) -> Self {
        self.conditions = conditions;
        self.main_fields = main_fields;
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    /// Command line for one build. Only allow-listed packages are bundled;
    /// everything else is a single-file transform.
    pub fn args(&self, request: &BundleRequest) -> Vec<String> {
        let mut args = vec![
            request.entry.display().to_string(),
            "--format=esm".to_string(),
            "--target=esnext".to_string(),
            "--platform=browser".to_string(),
            format!("--main-fields={}", self.main_fields.join(",")),
            format!("--conditions={}", self.conditions.join(",")),
            "--jsx-dev".to_string(),
            "--log-level=error".to_string(),
        ];
        if self.allow.allows_specifier(&request.raw_specifier) || self.allow.allows_path(&request.entry) {
            args.push("--bundle".to_string());
            args.push("--packages=external".to_string());
        }
        args
    }
}

#[async_trait]
impl ModuleBundler for EsbuildBundler {
    async fn bundle(&self, request: BundleRequest) -> Result<String, TransformError> {
        let args = self.args(&request);
        debug!(executable = %self.executable.display(), ?args, "Running esbuild");

        let output = Command::new(&self.executable)
            .args(&args)
            .current_dir(&request.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransformError::Io {
                path: self.executable.display().to_string(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(TransformError::Esbuild {
                file: request.entry.display().to_string(),
                location: parse_location(&stderr),
                stderr,
            });
        }
        let code = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(with_require_shim(code))
    }

    fn name(&self) -> &'static str {
        "esbuild"
    }
}

/// First `file:line:column:` diagnostic position in esbuild's stderr
fn parse_location(stderr: &str) -> Option<Location> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"(?m)^\s+(\S+):(\d+):(\d+):\s*$").expect("valid regex"));
    let captures = pattern.captures(stderr)?;
    Some(Location {
        file: captures[1].to_string(),
        line: captures[2].parse().ok()?,
        column: captures[3].parse().ok()?,
    })
}

/// esbuild leaves `require` calls of external packages in ESM output; give
/// them a `require` backed by top-level dynamic imports.
fn with_require_shim(code: String) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"(?:^|[^\w$.])(?:__)?require\(\s*["']([^"']+)["']\s*\)"#).expect("valid regex")
    });
    let specifiers: BTreeSet<&str> = pattern
        .captures_iter(&code)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let table: Vec<String> = specifiers
        .iter()
        .map(|specifier| format!("{}: await import({})", js_string(specifier), js_string(specifier)))
        .collect();
    format!("{}{}{}", INTEROP, require_prelude(&table), code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::Path;

    fn request(entry: &str, raw: &str) -> BundleRequest {
        BundleRequest {
            entry: PathBuf::from(entry),
            root: std::env::temp_dir(),
            raw_specifier: raw.to_string(),
        }
    }

    #[test]
    fn test_bundles_only_allow_listed_packages() {
        let bundler = EsbuildBundler::new(InlineAllowList::new(["@remix-run/react"]));
        let args = bundler.args(&request("/app/src/util.ts", "/src/util.ts"));
        assert!(args.contains(&"--format=esm".to_string()));
        assert!(args.contains(&"--conditions=workerd,worker,webworker,import".to_string()));
        assert!(args.contains(&"--main-fields=module,browser,main".to_string()));
        assert!(!args.contains(&"--bundle".to_string()));

        let args = bundler.args(&request("/app/node_modules/@remix-run/react/dist/index.js", "@remix-run/react"));
        assert!(args.contains(&"--bundle".to_string()));
        assert!(args.contains(&"--packages=external".to_string()));
    }

    #[test]
    fn test_parse_location() {
        let stderr = "✘ [ERROR] Expected \";\" but found \"x\"\n\n    src/bad.ts:3:10:\n      3 │ const a b\n";
        assert_eq!(
            parse_location(stderr),
            Some(Location {
                file: "src/bad.ts".into(),
                line: 3,
                column: 10
            })
        );
        assert_eq!(parse_location("no position"), None);
    }

    #[test]
    fn test_require_shim() {
        let code = "var x = __require(\"react\");\nconst y = require('scheduler');\nobj.require(\"nope\");\n".to_string();
        let out = with_require_shim(code);
        assert!(out.contains(r#"const __edgedev_required = { "react": await import("react"), "scheduler": await import("scheduler") };"#));
        assert!(!out.contains(r#""nope""#));

        let out = with_require_shim("export default 1;".into());
        assert!(out.contains("const __edgedev_required = {};"));
        assert!(out.ends_with("export default 1;"));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let bundler =
            EsbuildBundler::new(InlineAllowList::default()).with_executable("/nonexistent/edgedev-esbuild");
        let err = bundler.bundle(request("/app/a.js", "/a.js")).await.unwrap_err();
        assert_matches!(err, TransformError::Io { .. });
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let ok = script(dir.path(), "ok", "echo 'export default 42;'");
        let out = EsbuildBundler::new(InlineAllowList::default())
            .with_executable(&ok)
            .bundle(request("/app/a.js", "/a.js"))
            .await
            .unwrap();
        assert_eq!(out.trim(), "export default 42;");

        let failing = script(
            dir.path(),
            "failing",
            "printf '✘ [ERROR] Unexpected end of file\\n\\n    a.js:1:4:\\n' >&2; exit 1",
        );
        let err = EsbuildBundler::new(InlineAllowList::default())
            .with_executable(&failing)
            .bundle(request("/app/a.js", "/a.js"))
            .await
            .unwrap_err();
        assert_matches!(err, TransformError::Esbuild { ref location, .. } if location.as_ref().map(|l| l.line) == Some(1));
    }
}
