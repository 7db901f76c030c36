//! Integration tests for the dev server
//!
//! The router is driven with `oneshot` for the in-process sandbox, and over
//! a real socket when the sandbox is remote.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use edgedev_sandbox::SandboxHost;
use edgedev_tests::common::{module_service, project, ScanningEngine};
use edgedev_transport::{create_router, DevServerState, RemoteSandbox, FETCH_MODULE_PATH};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

fn in_process_app(root: &Path) -> Router {
    let modules = module_service(root);
    let host = SandboxHost::start(Arc::new(ScanningEngine::new()), modules.clone());
    create_router(DevServerState::new(Arc::new(host), modules).with_entry("/src/worker.ts"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("host", "localhost:5173")
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_request_runs_through_the_entry() {
    let dir = project();
    let app = in_process_app(dir.path());

    let response = app.oneshot(get("/products?page=2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /products via /src/worker.ts");
}

#[tokio::test]
async fn test_missing_entry_module_is_500() {
    let dir = project();
    let modules = module_service(dir.path());
    let host = SandboxHost::start(Arc::new(ScanningEngine::new()), modules.clone());
    let app = create_router(DevServerState::new(Arc::new(host), modules).with_entry("/src/missing.ts"));

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response).await.contains("/src/missing.ts"));
}

#[tokio::test]
async fn test_resolve_and_fetch_module_endpoints_agree() {
    let dir = project();
    let app = in_process_app(dir.path());

    let response = app
        .clone()
        .oneshot(get(
            "/__edgedev/resolve?specifier=lodash/debounce&referrer=/src/worker.ts&rawSpecifier=lodash/debounce",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert_eq!(location, "/node_modules/lodash/debounce.js");

    let request = Request::builder()
        .method("POST")
        .uri(FETCH_MODULE_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!(["lodash/debounce", "/src/worker.ts", {"cached": false}]).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(result["url"], location);
    assert!(result["code"]
        .as_str()
        .unwrap()
        .contains("__vite_ssr_exports__.default = module.exports;"));
}

#[tokio::test]
async fn test_remote_sandbox_chain() {
    let dir = project();

    // The worker runtime: an in-process sandbox behind its own server.
    let worker = in_process_app(dir.path());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, worker).await.unwrap();
    });

    let remote = RemoteSandbox::new(&format!("http://{}", addr)).unwrap();
    let app = create_router(
        DevServerState::new(Arc::new(remote), module_service(dir.path())).with_entry("/src/worker.ts"),
    );

    let response = app.oneshot(get("/remote/path")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /remote/path via /src/worker.ts");
}
