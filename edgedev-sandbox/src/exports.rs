//! Module exports objects
//!
//! An [`Exports`] object is shared between the runner, the module body that
//! fills it and every importer. Once a module's top-level body finishes the
//! runner freezes it; after that every write is rejected.

use crate::host::{Env, ExecutionContext};
use async_trait::async_trait;
use edgedev_common::{FetchRequest, FetchResponse};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Name of the default export
pub const DEFAULT_EXPORT: &str = "default";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExportsError {
    #[error("cannot assign to export '{0}' of a frozen module")]
    Frozen(String),
}

/// The `fetch(request, env, ctx)` capability a worker entry exposes
#[async_trait]
pub trait FetchHandler: Send + Sync {
    async fn fetch(
        &self,
        request: FetchRequest,
        env: &Env,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<FetchResponse>;
}

/// Handle to a value owned by the script engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueHandle(pub u64);

/// One exported binding
#[derive(Clone)]
pub enum ExportValue {
    Json(serde_json::Value),
    /// An object exposing a `fetch` method
    Handler(Arc<dyn FetchHandler>),
    Namespace(Exports),
    Opaque(OpaqueHandle),
}

impl ExportValue {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ExportValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&Exports> {
        match self {
            ExportValue::Namespace(ns) => Some(ns),
            _ => None,
        }
    }
}

impl fmt::Debug for ExportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportValue::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ExportValue::Handler(_) => f.write_str("Handler(..)"),
            ExportValue::Namespace(ns) => f.debug_tuple("Namespace").field(&ns.names()).finish(),
            ExportValue::Opaque(handle) => f.debug_tuple("Opaque").field(handle).finish(),
        }
    }
}

impl From<serde_json::Value> for ExportValue {
    fn from(value: serde_json::Value) -> Self {
        ExportValue::Json(value)
    }
}

#[derive(Default)]
struct ExportsState {
    values: BTreeMap<String, ExportValue>,
    frozen: bool,
}

/// Shared, freezable exports object
#[derive(Clone, Default)]
pub struct Exports {
    inner: Arc<RwLock<ExportsState>>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<ExportValue>) -> Result<(), ExportsError> {
        let name = name.into();
        let mut state = self.inner.write();
        if state.frozen {
            return Err(ExportsError::Frozen(name));
        }
        state.values.insert(name, value.into());
        Ok(())
    }

    pub fn set_handler(&self, name: impl Into<String>, handler: Arc<dyn FetchHandler>) -> Result<(), ExportsError> {
        self.set(name, ExportValue::Handler(handler))
    }

    pub fn get(&self, name: &str) -> Option<ExportValue> {
        self.inner.read().values.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().values.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    /// Reject every later write. Freezing twice is a no-op.
    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }

    /// Copy every named export of `source` that is not already defined,
    /// skipping `default` (the `export * from` rule)
    pub fn export_all_from(&self, source: &Exports) -> Result<(), ExportsError> {
        if self.ptr_eq(source) {
            return Ok(());
        }
        let entries: Vec<(String, ExportValue)> = source
            .inner
            .read()
            .values
            .iter()
            .filter(|(name, _)| name.as_str() != DEFAULT_EXPORT)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut state = self.inner.write();
        for (name, value) in entries {
            if state.values.contains_key(&name) {
                continue;
            }
            if state.frozen {
                return Err(ExportsError::Frozen(name));
            }
            state.values.insert(name, value);
        }
        Ok(())
    }

    /// Copy every export of `source`, `default` included
    pub fn assign_from(&self, source: &Exports) -> Result<(), ExportsError> {
        if self.ptr_eq(source) {
            return Ok(());
        }
        let entries: Vec<(String, ExportValue)> = source
            .inner
            .read()
            .values
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (name, value) in entries {
            self.set(name, value)?;
        }
        Ok(())
    }

    /// Drop every binding of an unfrozen object, used when a module body
    /// failed halfway so a retry starts from a clean object
    pub(crate) fn clear(&self) {
        let mut state = self.inner.write();
        if !state.frozen {
            state.values.clear();
        }
    }

    /// The `fetch` capability of the default export.
    ///
    /// The default export may be the handler object itself or a namespace
    /// whose `fetch` member is one.
    pub fn fetch_handler(&self) -> Option<Arc<dyn FetchHandler>> {
        match self.get(DEFAULT_EXPORT)? {
            ExportValue::Handler(handler) => Some(handler),
            ExportValue::Namespace(ns) => match ns.get("fetch")? {
                ExportValue::Handler(handler) => Some(handler),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address of the shared state, stable while any clone is alive
    #[cfg_attr(not(feature = "v8"), allow(dead_code))]
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("Exports")
            .field("names", &state.values.keys().collect::<Vec<_>>())
            .field("frozen", &state.frozen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frozen_exports_reject_writes() {
        let exports = Exports::new();
        exports.set("answer", json!(42)).unwrap();
        exports.freeze();

        assert_eq!(
            exports.set("answer", json!(0)),
            Err(ExportsError::Frozen("answer".into()))
        );
        assert_eq!(
            exports.set("added", json!(1)),
            Err(ExportsError::Frozen("added".into()))
        );
        assert_eq!(exports.get("answer").unwrap().as_json(), Some(&json!(42)));
        assert_eq!(exports.len(), 1);
    }

    #[test]
    fn test_export_all_skips_default_and_existing() {
        let source = Exports::new();
        source.set("default", json!("src-default")).unwrap();
        source.set("a", json!(1)).unwrap();
        source.set("b", json!(2)).unwrap();

        let target = Exports::new();
        target.set("b", json!("mine")).unwrap();
        target.export_all_from(&source).unwrap();

        assert_eq!(target.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(target.get("b").unwrap().as_json(), Some(&json!("mine")));
    }

    #[test]
    fn test_clear_leaves_frozen_objects_alone() {
        let exports = Exports::new();
        exports.set("x", json!(1)).unwrap();
        exports.freeze();
        exports.clear();
        assert!(exports.contains("x"));
    }
}
