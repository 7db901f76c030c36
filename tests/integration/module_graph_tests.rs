//! Integration tests for the module graph
//!
//! These tests drive a sandbox host whose fetch-module binding is the real
//! module service, so every import goes through fallback resolution,
//! bundling and the runner-form transform:
//! - relative imports are fetched once and evaluated once
//! - bare imports follow the fallback redirect
//! - a failing module does not poison the graph

use assert_matches::assert_matches;
use edgedev_common::{FetchModuleArgs, FetchRequest, FetchResult};
use edgedev_sandbox::{DispatchError, FetchModuleBinding, ModuleRunner, Sandbox, SandboxHost, DEFAULT_ENTRY_HEADER};
use edgedev_tests::common::{module_service, project, setup_test_logging, write, CountingBinding, ScanningEngine};
use std::sync::Arc;
use url::Url;

fn request(path: &str, entry: &str) -> FetchRequest {
    FetchRequest::get(Url::parse(&format!("http://localhost:5173{}", path)).unwrap())
        .with_header(DEFAULT_ENTRY_HEADER, entry)
}

#[tokio::test]
async fn test_entry_graph_is_fetched_through_the_fallback() {
    setup_test_logging();
    let dir = project();
    let counting = CountingBinding::new(module_service(dir.path()));
    let host = SandboxHost::start(Arc::new(ScanningEngine::new()), counting.clone());

    let response = host.dispatch_fetch(request("/hello", "/src/worker.ts")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text_body().await.unwrap(), "GET /hello via /src/worker.ts");

    let runner = host.runner();
    let greet = runner.get("/src/greet.ts").unwrap();
    assert!(greet.exports().is_frozen());
    assert!(greet.exports().contains("greet"));

    // The bare import was served from the file its redirect pointed at.
    let debounce = runner.get("lodash/debounce").unwrap();
    assert_eq!(
        debounce.evaluated().unwrap().file.as_deref().map(|f| f.ends_with("node_modules/lodash/debounce.js")),
        Some(true)
    );
    assert!(Arc::ptr_eq(&debounce, &runner.get("/node_modules/lodash/debounce.js").unwrap()));

    assert_eq!(counting.calls("/src/worker.ts"), 1);
    assert_eq!(counting.calls("/src/greet.ts"), 1);
    assert_eq!(counting.calls("lodash/debounce"), 1);
}

#[tokio::test]
async fn test_concurrent_requests_evaluate_each_module_once() {
    let dir = project();
    let counting = CountingBinding::new(module_service(dir.path()));
    let host = Arc::new(SandboxHost::start(Arc::new(ScanningEngine::new()), counting.clone()));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let host = Arc::clone(&host);
        tasks.push(tokio::spawn(async move {
            host.dispatch_fetch(request(&format!("/items/{}", i), "/src/worker.ts")).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().status(), 200);
    }

    assert_eq!(counting.total(), 3);
    assert_eq!(host.runner().len(), 4);
}

#[tokio::test]
async fn test_entry_without_fetch_handler() {
    let dir = project();
    let host = SandboxHost::start(Arc::new(ScanningEngine::new()), module_service(dir.path()));

    let err = host.try_dispatch(request("/", "/src/greet.ts")).await.unwrap_err();
    assert_matches!(err, DispatchError::MissingHandler { ref entry } if entry == "/src/greet.ts");

    let response = host.dispatch_fetch(request("/", "/src/greet.ts")).await;
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn test_broken_module_can_be_fixed_and_retried() {
    let dir = project();
    write(dir.path(), "src/broken.ts", "export enum Mode { Dev }\n");
    let service = module_service(dir.path());
    let runner = ModuleRunner::new(edgedev_sandbox::BindingSet::new(
        Arc::new(ScanningEngine::new()),
        service.clone(),
    ));

    let err = runner.import("/src/broken.ts").await.unwrap_err();
    assert!(err.to_string().contains("enum"), "unexpected error: {}", err);
    assert!(!runner.get("/src/broken.ts").unwrap().is_evaluated());

    write(dir.path(), "src/broken.ts", "export const mode = \"dev\";\n");
    let record = runner.import("/src/broken.ts").await.unwrap();
    assert!(record.exports().contains("mode"));
}

#[tokio::test]
async fn test_service_externalizes_builtins_and_configured_packages() {
    let dir = project();
    let service = module_service(dir.path());

    assert_matches!(
        service.fetch_module(FetchModuleArgs::new("node:crypto")).await.unwrap(),
        FetchResult::External(ref external) if external.externalize == "node:crypto"
    );
    assert_matches!(
        service.fetch_module(FetchModuleArgs::new("react")).await.unwrap(),
        FetchResult::External(_)
    );
}
