//! Dev server
//!
//! One axum router carries the three surfaces of the bridge:
//! - `POST /__edgedev/fetch-module`: JSON form of the fetch-module RPC
//! - `GET /__edgedev/resolve`: the module fallback HTTP contract
//! - everything else is bridged into the sandbox

use crate::adapter::{bridge, PipeCompletion, PipeOutcome};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use edgedev_common::{FallbackQuery, ResolveMethod, ResolverResult, RESOLVE_METHOD_HEADER};
use edgedev_resolver::ModuleService;
use edgedev_sandbox::{RpcError, Sandbox, DEFAULT_ENTRY_HEADER};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const FETCH_MODULE_PATH: &str = "/__edgedev/fetch-module";
pub const RESOLVE_PATH: &str = "/__edgedev/resolve";

/// Shared state for the dev server
#[derive(Clone)]
pub struct DevServerState {
    sandbox: Arc<dyn Sandbox>,
    modules: Arc<ModuleService>,
    /// Entry module named on every bridged request, if configured
    entry: Option<String>,
    entry_header: String,
}

impl DevServerState {
    pub fn new(sandbox: Arc<dyn Sandbox>, modules: Arc<ModuleService>) -> Self {
        Self {
            sandbox,
            modules,
            entry: None,
            entry_header: DEFAULT_ENTRY_HEADER.to_string(),
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn with_entry_header(mut self, header: impl Into<String>) -> Self {
        self.entry_header = header.into().to_ascii_lowercase();
        self
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn modules(&self) -> &Arc<ModuleService> {
        &self.modules
    }
}

/// Create dev server router
pub fn create_router(state: DevServerState) -> Router {
    Router::new()
        .route(FETCH_MODULE_PATH, post(handle_fetch_module))
        .route(RESOLVE_PATH, get(handle_resolve))
        .fallback(handle_bridge)
        .with_state(state)
}

/// Start dev server
pub async fn start_server(listener: tokio::net::TcpListener, state: DevServerState) -> Result<()> {
    let sandbox = state.sandbox.name().to_string();
    let app = create_router(state);

    let bind_addr = listener
        .local_addr()
        .context("Failed to obtain dev server bind address")?;
    info!(%bind_addr, sandbox = %sandbox, "Starting dev server");

    axum::serve(listener, app).await.context("Dev server error")?;

    Ok(())
}

/// Bridge any other request into the sandbox
async fn handle_bridge(State(state): State<DevServerState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match bridge(
        state.sandbox.as_ref(),
        request,
        &state.entry_header,
        state.entry.as_deref(),
    )
    .await
    {
        Ok((response, completion)) => {
            debug!(%method, path = %path, status = response.status().as_u16(), "Bridged request");
            tokio::spawn(watch_pipe(completion, method.to_string(), path));
            response
        }
        Err(err) => {
            warn!(%method, path = %path, error = %err, "Failed to bridge request");
            err.into_response()
        }
    }
}

async fn watch_pipe(completion: PipeCompletion, method: String, path: String) {
    match completion.wait().await {
        PipeOutcome::Completed => {}
        PipeOutcome::Failed(message) => {
            warn!(method = %method, path = %path, error = %message, "Response body failed mid-stream")
        }
        PipeOutcome::Aborted => debug!(method = %method, path = %path, "Client disconnected before body ended"),
    }
}

/// Handle POST to the fetch-module endpoint
async fn handle_fetch_module(State(state): State<DevServerState>, Json(body): Json<Value>) -> Response {
    match state.modules.handle_json(body).await {
        Ok(result) => Json(result).into_response(),
        Err(RpcError::Serialization(err)) => {
            debug!(error = %err, "Malformed fetch-module call");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            error!(error = %err, "fetch-module call failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Handle GET to the resolve endpoint
async fn handle_resolve(
    State(state): State<DevServerState>,
    headers: HeaderMap,
    Query(mut query): Query<FallbackQuery>,
) -> Response {
    if let Some(value) = headers.get(RESOLVE_METHOD_HEADER) {
        let parsed = value
            .to_str()
            .map_err(|e| e.to_string())
            .and_then(|v| v.parse::<ResolveMethod>().map_err(|e| e.to_string()));
        match parsed {
            Ok(method) => query.method = method,
            Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
        }
    }

    match state.modules.fallback().resolve(&query).await {
        Ok(ResolverResult::Redirect { location }) => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap_or_else(|e| internal_error(e.to_string())),
        Ok(ResolverResult::Inline(module)) => match serde_json::to_vec(&module) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/javascript")
                .body(Body::from(body))
                .unwrap_or_else(|e| internal_error(e.to_string())),
            Err(e) => internal_error(e.to_string()),
        },
        Err(err) => {
            warn!(specifier = ?query.specifier, referrer = ?query.referrer, error = %err, "Fallback resolution failed");
            let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, err.to_string()).into_response()
        }
    }
}

fn internal_error(message: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
