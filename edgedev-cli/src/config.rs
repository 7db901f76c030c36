//! Configuration for the edgedev binary

use edgedev_resolver::{
    BundlerKind, FallbackOptions, DEFAULT_INLINE_PACKAGES, SANDBOX_CONDITIONS, SANDBOX_MAIN_FIELDS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "edgedev.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeDevConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the dev server listens on
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5173".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Base url of the worker runtime requests are forwarded to. Unset means
    /// an in-process V8 sandbox (requires the `v8` feature).
    pub url: Option<String>,
    /// Entry module named on every bridged request
    pub entry: Option<String>,
    pub entry_header: String,
    /// V8 heap ceiling of the in-process sandbox
    pub heap_limit_mb: Option<usize>,
    /// `env` vars handed to the in-process sandbox's fetch handler
    pub vars: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            url: None,
            entry: None,
            entry_header: edgedev_transport::DEFAULT_ENTRY_HEADER.to_string(),
            heap_limit_mb: None,
            vars: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub root: PathBuf,
    /// Packages whose dependencies are bundled into the inline module
    pub inline_packages: Vec<String>,
    /// Packages the sandbox imports natively
    pub external: Vec<String>,
    pub bundler: BundlerKind,
    pub esbuild_path: Option<PathBuf>,
    pub conditions: Vec<String>,
    pub main_fields: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            inline_packages: DEFAULT_INLINE_PACKAGES.iter().map(|p| p.to_string()).collect(),
            external: Vec::new(),
            bundler: BundlerKind::Native,
            esbuild_path: None,
            conditions: SANDBOX_CONDITIONS.iter().map(|c| c.to_string()).collect(),
            main_fields: SANDBOX_MAIN_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl EdgeDevConfig {
    /// Load `path`, or `edgedev.toml` from the working directory when it
    /// exists. Without either, every section is defaulted.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("EDGEDEV_BIND") {
            self.server.bind = bind;
        }
        if let Ok(url) = std::env::var("EDGEDEV_SANDBOX_URL") {
            self.sandbox.url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.sandbox.entry_header.trim().is_empty() {
            return Err(ConfigError::Invalid("sandbox.entry_header must not be empty".into()));
        }
        if self.sandbox.heap_limit_mb == Some(0) {
            return Err(ConfigError::Invalid("sandbox.heap_limit_mb must be greater than zero".into()));
        }
        if let Some(entry) = &self.sandbox.entry {
            if !entry.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.entry must be an absolute module path, got '{}'",
                    entry
                )));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server.bind '{}': {}", self.server.bind, e)))
    }

    /// Resolver options with `root` made absolute against `cwd`
    pub fn fallback_options(&self, cwd: &Path) -> FallbackOptions {
        let resolver = &self.resolver;
        FallbackOptions {
            root: cwd.join(&resolver.root),
            inline_packages: resolver.inline_packages.clone(),
            bundler: resolver.bundler,
            esbuild_path: resolver.esbuild_path.clone(),
            conditions: resolver.conditions.clone(),
            main_fields: resolver.main_fields.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = EdgeDevConfig::parse("").unwrap();
        assert_eq!(config, EdgeDevConfig::default());
        assert_eq!(config.server.bind, "127.0.0.1:5173");
        assert_eq!(config.sandbox.entry_header, "x-vite-entry");
        assert_eq!(config.resolver.inline_packages, vec!["@remix-run/react"]);
        assert_eq!(config.resolver.bundler, BundlerKind::Native);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config = EdgeDevConfig::parse(
            r#"
[server]
bind = "0.0.0.0:8787"

[sandbox]
url = "http://127.0.0.1:9000"
entry = "/src/worker.ts"
heap_limit_mb = 128

[sandbox.vars]
API_BASE = "http://localhost:8787"

[resolver]
root = "app"
inline_packages = ["@remix-run/react", "lodash"]
external = ["react"]
bundler = "esbuild"
esbuild_path = "/usr/local/bin/esbuild"
"#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8787");
        assert_eq!(config.sandbox.url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.sandbox.entry_header, "x-vite-entry");
        assert_eq!(config.sandbox.heap_limit_mb, Some(128));
        assert_eq!(config.sandbox.vars["API_BASE"], "http://localhost:8787");
        assert_eq!(config.resolver.bundler, BundlerKind::Esbuild);
        assert_eq!(config.resolver.external, vec!["react"]);
        assert_eq!(config.resolver.conditions, vec!["workerd", "worker", "webworker", "import"]);

        let options = config.fallback_options(Path::new("/work"));
        assert_eq!(options.root, PathBuf::from("/work/app"));
        assert_eq!(options.esbuild_path, Some(PathBuf::from("/usr/local/bin/esbuild")));
        assert_eq!(options.inline_packages, vec!["@remix-run/react", "lodash"]);
    }

    #[test]
    fn test_unknown_bundler_is_rejected() {
        assert!(EdgeDevConfig::parse("[resolver]\nbundler = \"webpack\"\n").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = EdgeDevConfig::default();
        config.server.bind = "localhost".into();
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        let mut config = EdgeDevConfig::default();
        config.sandbox.entry = Some("src/worker.ts".into());
        assert_matches!(config.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("sandbox.entry"));

        let mut config = EdgeDevConfig::default();
        config.sandbox.heap_limit_mb = Some(0);
        assert_matches!(config.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("heap_limit_mb"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[sandbox]\nentry_header = \"x-entry\"\n").unwrap();
        let config = EdgeDevConfig::load(Some(&path)).unwrap();
        assert_eq!(config.sandbox.entry_header, "x-entry");

        let missing = dir.path().join("missing.toml");
        assert_matches!(EdgeDevConfig::load(Some(&missing)), Err(ConfigError::Read { .. }));

        std::fs::write(&path, "[server\n").unwrap();
        assert_matches!(EdgeDevConfig::load(Some(&path)), Err(ConfigError::Parse { .. }));
    }
}
