//! A transport whose worker lives in the same process.

use crate::{LifecycleAdapter, LifecycleError, Router, StopReason, Worker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tunnel_client::{CommunicationMonitor, WeakMonitor};
use tunnel_core::protocol::TunnelSettings;
use tunnel_core::{
    ChannelStatus, LifecycleState, Observer, PendingResponse, StartOptions, StatusCell, Transport,
    TransportError,
};

/// How messages reach a simulated worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Decode the envelope and dispatch through the [`Router`].
    #[default]
    Routed,
    /// Hand the raw bytes to [`Worker::handle_message`].
    Direct,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatorOptions {
    /// Opaque configuration passed to the worker's configure step.
    pub user_config: Option<Vec<u8>>,
    pub delivery: Delivery,
}

/// Simulated stand-in for a real worker channel.
///
/// Its status is driven solely by the embedded [`LifecycleAdapter`].
/// Cloning yields another handle to the same simulation.
///
/// A simulation with no worker answering raw messages is [`Delivery::Routed`]:
/// every message goes through the router the worker populated at configure
/// time. [`Delivery::Direct`] stands for a bound worker that handles the
/// bytes itself.
#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<Inner>,
}

struct Inner {
    status: StatusCell,
    lifecycle: LifecycleAdapter,
    delivery: Delivery,
    monitor: Mutex<Option<WeakMonitor>>,
}

impl SimulatedTransport {
    pub fn new(worker: Arc<dyn Worker>, options: SimulatorOptions) -> Self {
        let lifecycle = LifecycleAdapter::new(worker, Arc::new(Router::new()), options.user_config);
        Self {
            inner: Arc::new(Inner {
                status: StatusCell::new(),
                lifecycle,
                delivery: options.delivery,
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Bind this transport into `monitor` whenever the worker finishes starting.
    pub fn attach_monitor(&self, monitor: &CommunicationMonitor) {
        *self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(monitor.downgrade());
    }

    pub fn router(&self) -> &Arc<Router> {
        self.inner.lifecycle.router()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn settings(&self) -> Option<TunnelSettings> {
        self.inner.lifecycle.settings()
    }

    /// Configure and start the worker.
    ///
    /// Lifecycle failures are returned here, to the starter, and never reach
    /// the monitor.
    pub async fn start_tunnel(&self, options: &StartOptions) -> Result<(), LifecycleError> {
        self.inner
            .lifecycle
            .start(&self.inner.status, options)
            .await?;

        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(WeakMonitor::upgrade);
        if let Some(monitor) = monitor {
            monitor.bind(Arc::new(self.clone()));
        }
        Ok(())
    }

    pub async fn stop_tunnel(&self, reason: StopReason) {
        self.inner.lifecycle.stop(&self.inner.status, reason).await;
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn status(&self) -> ChannelStatus {
        self.inner.status.get()
    }

    async fn start(&self, options: StartOptions) -> Result<(), TransportError> {
        self.start_tunnel(&options)
            .await
            .map_err(|err| TransportError::Lifecycle(Box::new(err)))
    }

    async fn stop(&self) {
        self.stop_tunnel(StopReason::Requested).await;
    }

    fn send_message(&self, bytes: Vec<u8>) -> Result<PendingResponse, TransportError> {
        let status = self.inner.status.get();
        if !status.is_connected() {
            return Err(TransportError::InvalidState(status));
        }

        let (responder, pending) = PendingResponse::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let worker = inner.lifecycle.worker();
            let reply = deliver(worker.as_ref(), inner.lifecycle.router(), inner.delivery, bytes).await;
            responder.respond(reply);
        });
        Ok(pending)
    }

    fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.inner.status.subscribe(observer);
    }
}

/// Hand one message to a worker the way `delivery` says.
///
/// A router miss or handler failure is logged and produces no reply.
pub(crate) async fn deliver(
    worker: &dyn Worker,
    router: &Router,
    delivery: Delivery,
    bytes: Vec<u8>,
) -> Option<Vec<u8>> {
    match delivery {
        Delivery::Direct => worker.handle_message(bytes).await,
        Delivery::Routed => match router.handle_bytes(&bytes).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                tracing::warn!(error = %err, "simulated worker dropped message");
                None
            }
        },
    }
}
