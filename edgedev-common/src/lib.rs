//! Types shared between the edgedev host, the module runner and the
//! transport layer.

pub mod fetch;
pub mod path;
pub mod resolve;
pub mod rpc;

pub use fetch::*;
pub use resolve::*;
pub use rpc::*;
