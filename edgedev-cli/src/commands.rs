//! CLI command implementations

use crate::config::{EdgeDevConfig, SandboxConfig};
use anyhow::{anyhow, Context, Result};
use edgedev_common::{FallbackQuery, ResolveMethod};
use edgedev_resolver::{FallbackResolver, ModuleService};
use edgedev_sandbox::Sandbox;
use edgedev_transport::{start_server, DevServerState, RemoteSandbox};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Sandbox running in this process on the embedded V8 engine
#[cfg(feature = "v8")]
fn in_process_sandbox(config: &SandboxConfig, modules: Arc<ModuleService>) -> Result<Arc<dyn Sandbox>> {
    use edgedev_sandbox::{SandboxHost, V8Engine};

    let engine = match config.heap_limit_mb {
        Some(mb) => V8Engine::with_heap_limit(mb * 1024 * 1024),
        None => V8Engine::new(),
    }
    .context("Failed to start the V8 engine")?;
    let mut host = SandboxHost::start(Arc::new(engine), modules).with_entry_header(config.entry_header.clone());
    for (name, value) in &config.vars {
        host = host.with_var(name, value);
    }
    info!(vars = config.vars.len(), "In-process V8 sandbox ready");
    Ok(Arc::new(host))
}

#[cfg(not(feature = "v8"))]
fn in_process_sandbox(_config: &SandboxConfig, _modules: Arc<ModuleService>) -> Result<Arc<dyn Sandbox>> {
    Err(anyhow!(
        "no sandbox url configured; set [sandbox] url, pass --sandbox-url, or build with the `v8` feature"
    ))
}

/// Run the dev server until it fails or Ctrl-C arrives
pub async fn execute_serve(config: EdgeDevConfig, cwd: &Path) -> Result<()> {
    config.validate()?;

    let fallback = FallbackResolver::new(config.fallback_options(cwd));
    info!(
        root = %fallback.root().display(),
        bundler = fallback.bundler_name(),
        "Module fallback resolver ready"
    );
    let modules =
        Arc::new(ModuleService::new(Arc::new(fallback)).with_external(config.resolver.external.iter().cloned()));
    let sandbox: Arc<dyn Sandbox> = match &config.sandbox.url {
        Some(url) => Arc::new(RemoteSandbox::new(url).context("Failed to create remote sandbox")?),
        None => in_process_sandbox(&config.sandbox, Arc::clone(&modules))?,
    };
    info!(sandbox = sandbox.name(), "Sandbox ready");

    let mut state = DevServerState::new(sandbox, modules)
        .with_entry_header(config.sandbox.entry_header.clone());
    match &config.sandbox.entry {
        Some(entry) => state = state.with_entry(entry.clone()),
        None => warn!("No entry module configured; requests must carry the entry header themselves"),
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr()?)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    tokio::select! {
        result = start_server(listener, state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down dev server");
            Ok(())
        }
    }
}

/// Resolve one specifier and print the outcome as JSON
pub async fn execute_resolve(
    config: EdgeDevConfig,
    cwd: &Path,
    specifier: String,
    referrer: Option<String>,
    raw: Option<String>,
    method: ResolveMethod,
) -> Result<()> {
    let fallback = FallbackResolver::new(config.fallback_options(cwd));
    let mut query = FallbackQuery::new(specifier).with_method(method);
    if let Some(referrer) = referrer {
        query = query.with_referrer(referrer);
    }
    if let Some(raw) = raw {
        query = query.with_raw_specifier(raw);
    }

    let result = fallback
        .resolve(&query)
        .await
        .map_err(|e| anyhow!("resolution failed ({}): {}", e.status(), e))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
