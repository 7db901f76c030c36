//! Typed fetch-module RPC channel
//!
//! The sandbox side holds a [`ModuleRpcChannel`] and sees it as its
//! fetch-module binding. Every call is queued to a host task that forwards it
//! to the host's module service and sends the result back on a oneshot.
//! Cancelling the channel's token tears the host task down; pending and later
//! calls then fail with [`RpcError::Closed`].

use crate::vm::FetchModuleBinding;
use async_trait::async_trait;
use edgedev_common::{FetchModuleArgs, FetchResult};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("module RPC channel is closed")]
    Closed,

    #[error("host failed to serve module: {0}")]
    Remote(String),

    #[error("malformed module RPC payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct RpcEnvelope {
    args: FetchModuleArgs,
    reply: oneshot::Sender<Result<FetchResult, RpcError>>,
}

#[derive(Clone)]
pub struct ModuleRpcChannel {
    tx: mpsc::Sender<RpcEnvelope>,
    cancel: CancellationToken,
}

impl ModuleRpcChannel {
    /// Spawn the host task serving `host` and return the sandbox-side handle
    pub fn spawn(host: Arc<dyn FetchModuleBinding>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(serve(host, rx, cancel.clone()));
        Self { tx, cancel }
    }

    /// Close the channel. Calls already handed to the host still complete.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

async fn serve(
    host: Arc<dyn FetchModuleBinding>,
    mut rx: mpsc::Receiver<RpcEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Module RPC channel closed");
                break;
            }
            envelope = rx.recv() => {
                let Some(RpcEnvelope { args, reply }) = envelope else {
                    break;
                };
                let host = Arc::clone(&host);
                // Each call gets its own task: a module may block on an import
                // that needs another call to finish first.
                tokio::spawn(async move {
                    let id = args.id.clone();
                    let result = host.fetch_module(args).await;
                    if reply.send(result).is_err() {
                        warn!(module_id = %id, "Module RPC caller went away before the reply");
                    }
                });
            }
        }
    }
    rx.close();
}

#[async_trait]
impl FetchModuleBinding for ModuleRpcChannel {
    async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
        if self.cancel.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.tx
            .send(RpcEnvelope { args, reply })
            .await
            .map_err(|_| RpcError::Closed)?;
        response.await.map_err(|_| RpcError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use edgedev_common::ExternalKind;

    struct Echo;

    #[async_trait]
    impl FetchModuleBinding for Echo {
        async fn fetch_module(&self, args: FetchModuleArgs) -> Result<FetchResult, RpcError> {
            if args.id == "missing" {
                return Err(RpcError::Remote("not found".into()));
            }
            Ok(FetchResult::external(args.id, ExternalKind::Module))
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_host_task() {
        let channel = ModuleRpcChannel::spawn(Arc::new(Echo));
        let result = channel.fetch_module(FetchModuleArgs::new("react")).await.unwrap();
        assert_eq!(result, FetchResult::external("react", ExternalKind::Module));

        let err = channel.fetch_module(FetchModuleArgs::new("missing")).await.unwrap_err();
        assert_matches!(err, RpcError::Remote(msg) if msg == "not found");
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_calls() {
        let channel = ModuleRpcChannel::spawn(Arc::new(Echo));
        channel.close();
        assert!(channel.is_closed());
        let err = channel.fetch_module(FetchModuleArgs::new("react")).await.unwrap_err();
        assert_matches!(err, RpcError::Closed);
    }
}
