//! Protocol server adapters sharing one lifecycle contract: an RPC server
//! (tonic over a keepalive-tuned HTTP/2 accept loop), an HTTP server (axum),
//! and a dual-protocol gateway embedding both. Cross-cutting interceptors
//! (panic recovery, tracing, rate limiting, authentication) assemble here.

pub mod gateway;
pub mod http;
pub mod interceptor;
pub mod metrics;
pub mod rpc;

pub use crate::gateway::{GatewayConfig, GatewayServer};
pub use crate::http::{HttpConfig, HttpServer};
pub use crate::rpc::{RpcConfig, RpcServer};

use endpoint::Context;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Context(#[from] endpoint::Error),
}

/// The common server contract. `start` serves until the context is done or a
/// fatal error occurs; `stop` initiates graceful shutdown and waits for
/// `start` to wind down, bounded by its context.
#[async_trait::async_trait]
pub trait Server: Send + Sync {
    fn name(&self) -> &str;

    /// The configured address, or the actually-bound one once serving
    /// (useful with port 0).
    fn addr(&self) -> SocketAddr;

    async fn start(&self, cx: Context) -> Result<(), Error>;

    async fn stop(&self, cx: Context) -> Result<(), Error>;

    /// URL probed by external liveness checks, when one exists.
    fn health_endpoint(&self) -> Option<String> {
        None
    }
}

/// Start/stop handshake shared by the adapters: `stop` cancels, `start`
/// acknowledges by flipping the done flag on exit.
pub(crate) struct Lifecycle {
    pub shutdown: tokio_util::sync::CancellationToken,
    started: std::sync::atomic::AtomicBool,
    done_tx: tokio::sync::watch::Sender<bool>,
    done_rx: tokio::sync::watch::Receiver<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        Self {
            shutdown: tokio_util::sync::CancellationToken::new(),
            started: std::sync::atomic::AtomicBool::new(false),
            done_tx,
            done_rx,
        }
    }

    /// Claim the singleton start; a second claim fails.
    pub fn claim_start(&self) -> Result<(), Error> {
        if self
            .started
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    pub fn mark_done(&self) {
        let _ = self.done_tx.send(true);
    }

    /// Cancel and wait for `start` to acknowledge, bounded by `cx`.
    pub async fn stop(&self, cx: &Context) -> Result<(), Error> {
        self.shutdown.cancel();
        if !self.started.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }

        let mut done = self.done_rx.clone();
        loop {
            if *done.borrow() {
                return Ok(());
            }
            tokio::select! {
                () = cx.done() => {
                    return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
                }
                changed = done.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
