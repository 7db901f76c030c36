//! edgedev sandbox
//!
//! The in-process side of the dev server bridge: a module runner that pulls
//! runner-form code from the host over a typed channel, and a sandbox host
//! that dispatches fetch requests to the worker entry it imports.

pub mod channel;
pub mod exports;
pub mod host;
pub mod runner;
#[cfg(feature = "v8")]
pub mod v8;
pub mod vm;

pub use channel::{ModuleRpcChannel, RpcError};
pub use exports::{ExportValue, Exports, ExportsError, FetchHandler, OpaqueHandle, DEFAULT_EXPORT};
pub use host::{DispatchError, Env, ExecutionContext, Sandbox, SandboxHost, DEFAULT_ENTRY_HEADER};
pub use runner::{EvaluatedModule, ModuleRecord, ModuleRunner, RunnerError};
#[cfg(feature = "v8")]
pub use v8::V8Engine;
pub use vm::{
    wrapper_prefix, BindingSet, CompileUnit, EvalBinding, FetchModuleBinding, ImportMeta, ModuleContext, VmError,
    CONTEXT_KEYS,
};
