mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::EdgeDevConfig;
use edgedev_common::ResolveMethod;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "edgedev")]
#[command(about = "Dev server bridge for fetch-based edge sandboxes")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ./edgedev.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the dev server in front of a worker runtime
    Serve {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Base url of the worker runtime. Without one the in-process V8
        /// sandbox serves requests.
        #[arg(long)]
        sandbox_url: Option<String>,

        /// Entry module, e.g. /src/worker.ts
        #[arg(short, long)]
        entry: Option<String>,

        /// Project root modules are resolved in
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Resolve one specifier through the module fallback and print the result
    Resolve {
        /// Specifier as the sandbox requested it
        specifier: String,

        /// Normalized path of the importing module
        #[arg(long)]
        referrer: Option<String>,

        /// Specifier as written in source
        #[arg(long)]
        raw: Option<String>,

        /// Resolution method (import, require)
        #[arg(long, default_value = "import")]
        method: ResolveMethod,

        /// Project root modules are resolved in
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let mut config = EdgeDevConfig::load(cli.config.as_deref())?;
    config.apply_env();
    let cwd = std::env::current_dir().context("Failed to read working directory")?;

    match cli.command {
        Commands::Serve {
            bind,
            sandbox_url,
            entry,
            root,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(url) = sandbox_url {
                config.sandbox.url = Some(url);
            }
            if let Some(entry) = entry {
                config.sandbox.entry = Some(entry);
            }
            if let Some(root) = root {
                config.resolver.root = root;
            }
            commands::execute_serve(config, &cwd).await
        }
        Commands::Resolve {
            specifier,
            referrer,
            raw,
            method,
            root,
        } => {
            if let Some(root) = root {
                config.resolver.root = root;
            }
            commands::execute_resolve(config, &cwd, specifier, referrer, raw, method).await
        }
    }
}

/// Initialize tracing to stderr, and to `log_file` when given
fn init_tracing(verbose: bool, log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "info" };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let name = path.file_name().context("Log file path has no file name")?;
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("edgedev={}", log_level))),
        )
        .init();

    Ok(guard)
}
