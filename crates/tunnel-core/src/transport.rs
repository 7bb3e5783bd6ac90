//! The channel a host uses to reach its worker.
//!
//! A [`Transport`] moves opaque bytes. It knows nothing about envelopes or
//! message types; those live a layer up in the monitor.

use crate::{ChannelStatus, Observer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Options passed to [`Transport::start`].
pub type StartOptions = BTreeMap<String, serde_json::Value>;

/// A channel to one worker, real or simulated.
///
/// The trait is object-safe; the monitor holds it as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Snapshot of the current channel status.
    fn status(&self) -> ChannelStatus;

    /// Bring the channel up. Returns once the worker is running or has failed.
    async fn start(&self, options: StartOptions) -> Result<(), TransportError>;

    /// Tear the channel down. Stopping an idle channel does nothing.
    async fn stop(&self);

    /// Dispatch one message.
    ///
    /// Errors here mean the bytes never left. Once dispatched, the returned
    /// [`PendingResponse`] resolves with the worker's reply, or `None` if the
    /// worker completed without one.
    fn send_message(&self, bytes: Vec<u8>) -> Result<PendingResponse, TransportError>;

    /// Register for status notifications.
    fn subscribe(&self, observer: Arc<dyn Observer>);
}

/// The not-yet-arrived reply to a dispatched message.
///
/// Resolves to `None` if the responder is dropped without answering.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Option<Vec<u8>>>,
}

impl PendingResponse {
    /// A linked responder/receiver pair.
    pub fn channel() -> (Responder, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (Responder { tx }, PendingResponse { rx })
    }

    /// A response that is already available.
    pub fn ready(body: Option<Vec<u8>>) -> Self {
        let (responder, pending) = Self::channel();
        responder.respond(body);
        pending
    }
}

impl Future for PendingResponse {
    type Output = Option<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.ok().flatten())
    }
}

/// Completes a [`PendingResponse`]. Safe to move to any task or thread.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Option<Vec<u8>>>,
}

impl Responder {
    pub fn respond(self, body: Option<Vec<u8>>) {
        // The receiver may have been dropped by a caller that stopped caring.
        let _ = self.tx.send(body);
    }
}

/// Error raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel is {0}, not connected")]
    InvalidState(ChannelStatus),
    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encoding failed: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("channel closed")]
    Closed,
    #[error("worker lifecycle failed: {0}")]
    Lifecycle(#[source] Box<dyn std::error::Error + Send + Sync>),
}
