//! V8 eval binding using deno_core
//!
//! A `JsRuntime` is not `Send`, so each [`V8Engine`] owns a dedicated thread
//! running the isolate on a current-thread tokio runtime. Callers talk to it
//! over a command channel. Module bodies are compiled from their runner-form
//! wrapper, tagged with their filename, and called with the five context
//! values; the context keys reach back into the [`ModuleRunner`] through ops.
//!
//! Every module's exports live twice: as a JS object inside the isolate, and
//! mirrored into the runner's [`Exports`] once the body has finished. Values
//! the mirror cannot carry as JSON stay in the isolate and are referenced by
//! handle; `fetch` handlers become [`FetchHandler`]s that dispatch back into
//! the isolate.
//!
//! [`ModuleRunner`]: crate::runner::ModuleRunner

mod ops;

use crate::exports::{ExportValue, Exports, FetchHandler, OpaqueHandle};
use crate::host::{Env, ExecutionContext};
use crate::vm::{CompileUnit, EvalBinding, ModuleContext, VmError};
use async_trait::async_trait;
use deno_core::{FsModuleLoader, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use edgedev_common::{Body, FetchRequest, FetchResponse};
use ops::EngineState;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::poll_fn;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// How a command ended inside the isolate
#[derive(Debug, Error)]
pub(crate) enum Failure {
    #[error("{0}")]
    Compile(String),

    #[error("{0}")]
    Exception(String),

    #[error("script engine has stopped")]
    Stopped,
}

impl Failure {
    fn into_vm_error(self, filename: &str) -> VmError {
        match self {
            Failure::Compile(message) => VmError::Compile {
                filename: filename.to_string(),
                message,
            },
            Failure::Exception(message) => VmError::Exception {
                filename: filename.to_string(),
                message,
            },
            Failure::Stopped => VmError::Stopped,
        }
    }
}

/// JSON result of a settled command
type Reply = oneshot::Sender<Result<String, Failure>>;

enum Command {
    Evaluate {
        unit: CompileUnit,
        context: ModuleContext,
        reply: Reply,
    },
    ImportExternal {
        specifier: String,
        slot: u32,
        reply: Reply,
    },
    Fetch {
        slot: u32,
        name: String,
        payload: String,
        reply: Reply,
    },
    Shutdown,
}

/// Numbers each exports object the isolate has seen. The isolate keys its
/// JS-side exports objects by the same numbers.
#[derive(Default)]
pub(crate) struct Slots {
    table: Mutex<SlotTable>,
}

#[derive(Default)]
struct SlotTable {
    by_identity: HashMap<usize, u32>,
    exports: HashMap<u32, Exports>,
    next: u32,
}

impl Slots {
    pub(crate) fn slot_for(&self, exports: &Exports) -> u32 {
        let mut table = self.table.lock();
        if let Some(slot) = table.by_identity.get(&exports.identity()) {
            return *slot;
        }
        let slot = table.next;
        table.next += 1;
        table.by_identity.insert(exports.identity(), slot);
        table.exports.insert(slot, exports.clone());
        slot
    }

    fn exports(&self, slot: u32) -> Option<Exports> {
        self.table.lock().exports.get(&slot).cloned()
    }

    fn clear(&self) {
        let mut table = self.table.lock();
        table.by_identity.clear();
        table.exports.clear();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ExportKind {
    Json,
    Handler,
    Namespace,
    Opaque,
}

/// One export as the isolate describes it after a module body finished
#[derive(Debug, Deserialize)]
struct DescribedExport {
    name: String,
    kind: ExportKind,
    #[serde(default)]
    value: Value,
    slot: Option<u32>,
    handle: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    status: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: String,
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    slots: Arc<Slots>,
}

impl Shared {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<String, Failure> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).map_err(|_| Failure::Stopped)?;
        rx.await.map_err(|_| Failure::Stopped)?
    }

    /// Copy the isolate's description of the exports in `slot` into `exports`
    fn mirror(self: &Arc<Self>, slot: u32, exports: &Exports, described: &str) -> Result<(), VmError> {
        let described: Vec<DescribedExport> =
            serde_json::from_str(described).map_err(|e| VmError::Protocol(e.to_string()))?;
        for entry in described {
            let value = match entry.kind {
                ExportKind::Json => ExportValue::Json(entry.value),
                ExportKind::Handler => ExportValue::Handler(Arc::new(V8Handler {
                    shared: Arc::clone(self),
                    slot,
                    name: entry.name.clone(),
                })),
                ExportKind::Namespace => match entry.slot.and_then(|s| self.slots.exports(s)) {
                    Some(namespace) => ExportValue::Namespace(namespace),
                    None => ExportValue::Opaque(OpaqueHandle(entry.handle.unwrap_or_default())),
                },
                ExportKind::Opaque => ExportValue::Opaque(OpaqueHandle(entry.handle.unwrap_or_default())),
            };
            exports.set(entry.name, value)?;
        }
        Ok(())
    }
}

/// Evaluates runner-form modules in an embedded V8 isolate
pub struct V8Engine {
    shared: Arc<Shared>,
}

impl V8Engine {
    pub fn new() -> Result<Self, VmError> {
        Self::spawn(None)
    }

    /// Engine whose V8 heap may not grow past `max_bytes`
    pub fn with_heap_limit(max_bytes: usize) -> Result<Self, VmError> {
        Self::spawn(Some(max_bytes))
    }

    fn spawn(max_heap: Option<usize>) -> Result<Self, VmError> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let slots = Arc::new(Slots::default());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_slots = Arc::clone(&slots);
        std::thread::Builder::new()
            .name("edgedev-v8".to_string())
            .spawn(move || engine_thread(receiver, thread_slots, max_heap, ready_tx))
            .map_err(|e| VmError::Startup(e.to_string()))?;
        ready_rx
            .recv()
            .map_err(|_| VmError::Stopped)?
            .map_err(VmError::Startup)?;

        info!(heap_limit = ?max_heap, "V8 engine started");
        Ok(Self {
            shared: Arc::new(Shared { commands, slots }),
        })
    }
}

#[async_trait]
impl EvalBinding for V8Engine {
    async fn evaluate(&self, unit: CompileUnit, context: ModuleContext) -> Result<(), VmError> {
        let filename = unit.filename.clone();
        let exports = context.exports().clone();
        let slot = self.shared.slots.slot_for(&exports);
        let described = self
            .shared
            .request(|reply| Command::Evaluate { unit, context, reply })
            .await
            .map_err(|failure| failure.into_vm_error(&filename))?;
        self.shared.mirror(slot, &exports, &described)
    }

    async fn import_external(&self, specifier: &str, exports: &Exports) -> Result<(), VmError> {
        let slot = self.shared.slots.slot_for(exports);
        let described = self
            .shared
            .request(|reply| Command::ImportExternal {
                specifier: specifier.to_string(),
                slot,
                reply,
            })
            .await
            .map_err(|failure| failure.into_vm_error(specifier))?;
        self.shared.mirror(slot, exports, &described)
    }

    fn close(&self) {
        // Handlers in the slot table hold the engine; dropping them breaks
        // the cycle.
        self.shared.slots.clear();
        let _ = self.shared.commands.send(Command::Shutdown);
    }

    fn name(&self) -> &str {
        "v8"
    }
}

impl Drop for V8Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// A `fetch` handler living in the isolate
struct V8Handler {
    shared: Arc<Shared>,
    slot: u32,
    name: String,
}

#[async_trait]
impl FetchHandler for V8Handler {
    async fn fetch(
        &self,
        mut request: FetchRequest,
        env: &Env,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<FetchResponse> {
        let body = match request.take_body() {
            Some(body) => Some(body.text().await?),
            None => None,
        };
        let headers: Vec<(&str, &str)> = request.headers().iter().collect();
        let payload = json!({
            "method": request.method(),
            "url": request.url().as_str(),
            "headers": headers,
            "body": body,
            "env": env.vars(),
        });

        let wire = self
            .shared
            .request(|reply| Command::Fetch {
                slot: self.slot,
                name: self.name.clone(),
                payload: payload.to_string(),
                reply,
            })
            .await?;
        let wire: WireResponse = serde_json::from_str(&wire)?;

        let mut response = FetchResponse::new(wire.status);
        if !wire.status_text.is_empty() {
            response = response.with_status_text(wire.status_text);
        }
        for (name, value) in wire.headers {
            response.headers_mut().append(name, value);
        }
        Ok(response.with_body(Body::from(wire.body)))
    }
}

fn engine_thread(
    mut receiver: mpsc::UnboundedReceiver<Command>,
    slots: Arc<Slots>,
    max_heap: Option<usize>,
    ready: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    rt.block_on(async move {
        let mut runtime = match create_runtime(slots, max_heap) {
            Ok(runtime) => runtime,
            Err(message) => {
                let _ = ready.send(Err(message));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        drive(&mut runtime, &mut receiver).await;
        debug!("V8 engine stopped");
    });
}

fn create_runtime(slots: Arc<Slots>, max_heap: Option<usize>) -> Result<JsRuntime, String> {
    // Initial heap is 10MB or a tenth of the limit, whichever is smaller
    let create_params = max_heap.map(|max_bytes| {
        let initial_bytes = (max_bytes / 10).min(10 * 1024 * 1024);
        deno_core::v8::CreateParams::default().heap_limits(initial_bytes, max_bytes)
    });

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ops::extension()],
        module_loader: Some(Rc::new(FsModuleLoader)),
        create_params,
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(EngineState::new(slots));
    runtime
        .execute_script("ext:edgedev/bootstrap.js", BOOTSTRAP)
        .map_err(|e| e.to_string())?;
    Ok(runtime)
}

/// Run commands and the event loop until shutdown
async fn drive(runtime: &mut JsRuntime, commands: &mut mpsc::UnboundedReceiver<Command>) {
    poll_fn(|cx| {
        loop {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Shutdown)) | Poll::Ready(None) => return Poll::Ready(()),
                Poll::Ready(Some(command)) => run_command(runtime, command),
                Poll::Pending => break,
            }
        }
        if let Poll::Ready(Err(err)) = runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
            let message = err.to_string();
            warn!(error = %message, "Script engine event loop failed");
            runtime.op_state().borrow_mut().borrow_mut::<EngineState>().fail_all(&message);
        }
        Poll::Pending
    })
    .await
}

fn js_string(value: &str) -> String {
    Value::from(value).to_string()
}

fn run_command(runtime: &mut JsRuntime, command: Command) {
    let op_state = runtime.op_state();
    let (token, script) = {
        let mut state = op_state.borrow_mut();
        let engine = state.borrow_mut::<EngineState>();
        match command {
            Command::Evaluate { unit, context, reply } => {
                let slot = engine.slots.slot_for(context.exports());
                let meta = context.import_meta();
                let meta = json!({
                    "url": meta.url,
                    "filename": meta.filename,
                    "dirname": meta.dirname,
                });
                debug!(module_id = %context.id(), slot, "Compiling module");
                engine.contexts.insert(slot, context);
                let token = engine.park(reply);
                let script = format!(
                    "__edgedev.run({}, {}, {}, {}, {});",
                    token,
                    slot,
                    js_string(&unit.filename),
                    meta,
                    js_string(&unit.source)
                );
                (token, script)
            }
            Command::ImportExternal { specifier, slot, reply } => {
                let token = engine.park(reply);
                let script = format!("__edgedev.external({}, {}, {});", token, slot, js_string(&specifier));
                (token, script)
            }
            Command::Fetch {
                slot,
                name,
                payload,
                reply,
            } => {
                let token = engine.park(reply);
                let script = format!(
                    "__edgedev.dispatch({}, {}, {}, {});",
                    token,
                    slot,
                    js_string(&name),
                    payload
                );
                (token, script)
            }
            Command::Shutdown => return,
        }
    };

    if let Err(err) = runtime.execute_script("edgedev:command", script) {
        let reply = op_state.borrow_mut().borrow_mut::<EngineState>().take(token);
        if let Some(reply) = reply {
            let _ = reply.send(Err(Failure::Exception(err.to_string())));
        }
    }
}
