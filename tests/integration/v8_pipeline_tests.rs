//! The project fixture served end to end on the embedded V8 engine

use edgedev_common::FetchRequest;
use edgedev_sandbox::{Sandbox, SandboxHost, V8Engine, DEFAULT_ENTRY_HEADER};
use edgedev_tests::common::{module_service, project, setup_test_logging, CountingBinding};
use std::sync::Arc;
use url::Url;

#[tokio::test]
async fn test_typescript_entry_runs_on_v8() {
    setup_test_logging();
    let dir = project();
    let counting = CountingBinding::new(module_service(dir.path()));
    let host = SandboxHost::start(Arc::new(V8Engine::new().unwrap()), counting.clone());

    let request = FetchRequest::get(Url::parse("http://localhost:5173/hello").unwrap())
        .with_header(DEFAULT_ENTRY_HEADER, "/src/worker.ts");
    let response = host.dispatch_fetch(request).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text_body().await.unwrap(), "hello edge");

    // A second request reuses the evaluated graph.
    let request = FetchRequest::get(Url::parse("http://localhost:5173/again").unwrap())
        .with_header(DEFAULT_ENTRY_HEADER, "/src/worker.ts");
    assert_eq!(host.dispatch_fetch(request).await.status(), 200);
    assert_eq!(counting.calls("/src/worker.ts"), 1);
    assert_eq!(counting.calls("/src/greet.ts"), 1);

    host.shutdown();
}
