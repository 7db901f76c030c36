//! Ops the bootstrap script calls into

use super::{Failure, Reply, Slots};
use crate::vm::ModuleContext;
use deno_core::{op2, Extension, OpState};
use deno_error::JsErrorBox;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SETTLE_OK: u32 = 0;
const SETTLE_COMPILE: u32 = 1;

/// Engine-thread state reachable from ops
pub(super) struct EngineState {
    pub slots: Arc<Slots>,
    /// Context of the module body that owns each slot
    pub contexts: HashMap<u32, ModuleContext>,
    pending: HashMap<u32, Reply>,
    next_token: u32,
}

impl EngineState {
    pub fn new(slots: Arc<Slots>) -> Self {
        Self {
            slots,
            contexts: HashMap::new(),
            pending: HashMap::new(),
            next_token: 0,
        }
    }

    /// Hold `reply` until the script settles the returned token
    pub fn park(&mut self, reply: Reply) -> u32 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.pending.insert(token, reply);
        token
    }

    pub fn take(&mut self, token: u32) -> Option<Reply> {
        self.pending.remove(&token)
    }

    pub fn fail_all(&mut self, message: &str) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(Failure::Exception(message.to_string())));
        }
    }
}

/// `__vite_ssr_import__` and `__vite_ssr_dynamic_import__` of the module in
/// `slot`. Resolves to the slot of the imported module's exports.
#[op2(async)]
#[serde]
pub async fn op_edgedev_import(
    state: Rc<RefCell<OpState>>,
    #[smi] slot: u32,
    #[string] specifier: String,
    dynamic: bool,
) -> Result<u32, JsErrorBox> {
    let (context, slots) = {
        let state = state.borrow();
        let engine = state.borrow::<EngineState>();
        let context = engine
            .contexts
            .get(&slot)
            .cloned()
            .ok_or_else(|| JsErrorBox::generic(format!("no module is bound to slot {}", slot)))?;
        (context, Arc::clone(&engine.slots))
    };

    let imported = if dynamic {
        context.dynamic_import(&specifier).await
    } else {
        context.import(&specifier).await
    };
    let exports = imported.map_err(|e| JsErrorBox::generic(e.to_string()))?;
    Ok(slots.slot_for(&exports))
}

/// Hand the outcome of a command back to the Rust caller waiting on `token`
#[op2(fast)]
pub fn op_edgedev_settle(state: &mut OpState, #[smi] token: u32, #[smi] status: u32, #[string] payload: &str) {
    let Some(reply) = state.borrow_mut::<EngineState>().take(token) else {
        warn!(token, "Settled an unknown engine command");
        return;
    };
    let result = match status {
        SETTLE_OK => Ok(payload.to_string()),
        SETTLE_COMPILE => Err(Failure::Compile(payload.to_string())),
        _ => Err(Failure::Exception(payload.to_string())),
    };
    let _ = reply.send(result);
}

#[op2(fast)]
pub fn op_edgedev_log(#[smi] level: u32, #[string] message: &str) {
    match level {
        0 => debug!(target: "edgedev::console", "{}", message),
        1 => info!(target: "edgedev::console", "{}", message),
        2 => warn!(target: "edgedev::console", "{}", message),
        _ => error!(target: "edgedev::console", "{}", message),
    }
}

pub(super) fn extension() -> Extension {
    let ops = vec![op_edgedev_import(), op_edgedev_settle(), op_edgedev_log()];

    Extension {
        name: "edgedev_engine",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}
