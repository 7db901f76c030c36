//! Sandbox host
//!
//! Owns one module runner and dispatches inbound fetch requests to the
//! worker entry named by the entry header. Per-request failures never
//! escape: they come back as `500` responses.

use crate::channel::ModuleRpcChannel;
use crate::runner::{ModuleRunner, RunnerError};
use crate::vm::{BindingSet, EvalBinding, FetchModuleBinding};
use async_trait::async_trait;
use edgedev_common::{FetchRequest, FetchResponse};
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Header naming the entry module of a request
pub const DEFAULT_ENTRY_HEADER: &str = "x-vite-entry";

/// Something that can answer a fetch request
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run the request through the worker entry. Never fails: errors are
    /// rendered as responses.
    async fn dispatch_fetch(&self, request: FetchRequest) -> FetchResponse;

    /// Get sandbox backend name
    fn name(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request has no '{0}' header naming the entry module")]
    MissingEntry(String),

    #[error("entry module '{entry}' does not export a default object with a fetch handler")]
    MissingHandler { entry: String },

    #[error(transparent)]
    Import(#[from] RunnerError),

    #[error("{0:#}")]
    Handler(anyhow::Error),

    #[error("sandbox has been shut down")]
    ShutDown,
}

/// The `env` argument handed to the entry's fetch handler
#[derive(Clone)]
pub struct Env {
    bindings: BindingSet,
    vars: BTreeMap<String, String>,
}

impl Env {
    pub fn new(bindings: BindingSet) -> Self {
        Self {
            bindings,
            vars: BTreeMap::new(),
        }
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// Lifecycle context of one dispatch. Both hooks are no-ops in development.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    _private: (),
}

impl ExecutionContext {
    pub fn wait_until<F>(&self, _future: F)
    where
        F: Future + Send + 'static,
    {
    }

    pub fn pass_through_on_exception(&self) {}
}

pub struct SandboxHost {
    runner: Arc<ModuleRunner>,
    env: Env,
    entry_header: String,
    channel: Option<ModuleRpcChannel>,
    shut_down: AtomicBool,
}

impl SandboxHost {
    /// Host over an already assembled binding set
    pub fn new(bindings: BindingSet) -> Self {
        Self {
            runner: ModuleRunner::new(bindings.clone()),
            env: Env::new(bindings),
            entry_header: DEFAULT_ENTRY_HEADER.to_string(),
            channel: None,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Wire `eval` together with a typed RPC channel in front of the host's
    /// module service
    pub fn start(eval: Arc<dyn EvalBinding>, module_service: Arc<dyn FetchModuleBinding>) -> Self {
        let channel = ModuleRpcChannel::spawn(module_service);
        let bindings = BindingSet::new(eval, Arc::new(channel.clone()));
        let mut host = Self::new(bindings);
        host.channel = Some(channel);
        host
    }

    pub fn with_entry_header(mut self, header: impl Into<String>) -> Self {
        self.entry_header = header.into().to_ascii_lowercase();
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.vars.insert(name.into(), value.into());
        self
    }

    pub fn entry_header(&self) -> &str {
        &self.entry_header
    }

    pub fn runner(&self) -> &Arc<ModuleRunner> {
        &self.runner
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Dispatch keeping the typed error
    pub async fn try_dispatch(&self, request: FetchRequest) -> Result<FetchResponse, DispatchError> {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        let entry = request
            .headers()
            .get(&self.entry_header)
            .ok_or_else(|| DispatchError::MissingEntry(self.entry_header.clone()))?;

        let record = self.runner.import(&entry).await?;
        let handler = record
            .exports()
            .fetch_handler()
            .ok_or_else(|| DispatchError::MissingHandler {
                entry: entry.clone(),
            })?;

        handler
            .fetch(request, &self.env, &ExecutionContext::default())
            .await
            .map_err(DispatchError::Handler)
    }

    /// Close the RPC channel and the eval binding. Later dispatches fail
    /// with [`DispatchError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = &self.channel {
            channel.close();
        }
        self.env.bindings().eval.close();
        info!(modules = self.runner.len(), "Sandbox host shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for SandboxHost {
    async fn dispatch_fetch(&self, request: FetchRequest) -> FetchResponse {
        let method = request.method().to_string();
        let url = request.url().to_string();

        match AssertUnwindSafe(self.try_dispatch(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                match &err {
                    DispatchError::MissingEntry(_) | DispatchError::MissingHandler { .. } => {
                        warn!(%method, %url, error = %err, "Dispatch rejected")
                    }
                    _ => error!(%method, %url, error = %err, "Dispatch failed"),
                }
                FetchResponse::text(500, err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%method, %url, panic = %message, "Fetch handler panicked");
                FetchResponse::text(500, message)
            }
        }
    }

    fn name(&self) -> &str {
        self.env.bindings().eval.name()
    }
}

impl Drop for SandboxHost {
    fn drop(&mut self) {
        if let Some(channel) = &self.channel {
            channel.close();
        }
        if !self.shut_down.load(Ordering::SeqCst) {
            self.env.bindings().eval.close();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "fetch handler panicked".to_string()
    }
}
