//! edgedev transport
//!
//! The host-socket side of the bridge: the protocol adapter between axum and
//! fetch-style requests, the dev server router, and a sandbox that lives in
//! another process.

pub mod adapter;
pub mod remote;
pub mod server;

pub use adapter::{bridge, to_request, to_response, AdapterError, PipeCompletion, PipeOutcome, TrackedBody};
pub use remote::{RemoteError, RemoteSandbox};
pub use server::{create_router, start_server, DevServerState, FETCH_MODULE_PATH, RESOLVE_PATH};

pub use edgedev_sandbox::DEFAULT_ENTRY_HEADER;
