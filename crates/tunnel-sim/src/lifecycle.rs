//! Drives a simulated worker through configure, start and stop.
//!
//! ```text
//! NotStarted -> Configuring -> Starting -> Started -> Stopping -> Stopped
//!                    |             |
//!                    |             +-> Stopping -> Stopped   (start failed)
//!                    +-> NotStarted                           (configure failed)
//! ```
//!
//! Channel status follows along: `Connecting` once configuration succeeds,
//! then `Connected`, or `Disconnecting` then `Disconnected` on failure or stop.

use crate::{BoxError, ConfigError, Configuration, Router, StopReason, Worker};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tunnel_core::protocol::TunnelSettings;
use tunnel_core::{ChannelStatus, LifecycleState, StartOptions, StatusCell};

/// Error surfaced to whoever started or stopped the worker.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("worker configuration failed: {0}")]
    Configuration(#[source] ConfigError),
    #[error("worker failed to start: {0}")]
    Start(#[source] BoxError),
    #[error("cannot {action} a worker that is {from}")]
    InvalidTransition {
        from: LifecycleState,
        action: &'static str,
    },
}

pub struct LifecycleAdapter {
    worker: Arc<dyn Worker>,
    router: Arc<Router>,
    user_config: Option<Vec<u8>>,
    /// Held for the whole of a transition so start and stop cannot interleave.
    transition: tokio::sync::Mutex<()>,
    state: Mutex<Snapshot>,
}

#[derive(Default)]
struct Snapshot {
    state: LifecycleState,
    settings: Option<TunnelSettings>,
    started_at: Option<Instant>,
}

impl LifecycleAdapter {
    pub fn new(worker: Arc<dyn Worker>, router: Arc<Router>, user_config: Option<Vec<u8>>) -> Self {
        Self {
            worker,
            router,
            user_config,
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(Snapshot::default()),
        }
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn state(&self) -> LifecycleState {
        self.snapshot().state
    }

    /// Settings the worker applied during its last successful configuration.
    pub fn settings(&self) -> Option<TunnelSettings> {
        self.snapshot().settings.clone()
    }

    /// When the worker last finished starting.
    pub fn started_at(&self) -> Option<Instant> {
        self.snapshot().started_at
    }

    fn snapshot(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, next: LifecycleState) {
        let mut snapshot = self.snapshot();
        tracing::debug!(from = %snapshot.state, to = %next, "worker lifecycle");
        snapshot.state = next;
    }

    /// Configure and start the worker, reporting progress through `status`.
    pub async fn start(
        &self,
        status: &StatusCell,
        options: &StartOptions,
    ) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;

        let from = self.state();
        if !matches!(from, LifecycleState::NotStarted | LifecycleState::Stopped) {
            return Err(LifecycleError::InvalidTransition {
                from,
                action: "start",
            });
        }

        self.enter(LifecycleState::Configuring);
        let mut configuration = Configuration::new(self.user_config.as_deref(), &self.router);
        if let Err(err) = self.worker.configure(&mut configuration).await {
            tracing::warn!(error = %err, "worker configuration failed");
            self.enter(LifecycleState::NotStarted);
            return Err(LifecycleError::Configuration(err));
        }
        self.snapshot().settings = configuration.into_settings();

        self.enter(LifecycleState::Starting);
        status.set(ChannelStatus::Connecting);
        if let Err(err) = self.worker.start(options).await {
            tracing::warn!(error = %err, "worker failed to start");
            self.enter(LifecycleState::Stopping);
            status.set(ChannelStatus::Disconnecting);
            self.enter(LifecycleState::Stopped);
            status.set(ChannelStatus::Disconnected);
            return Err(LifecycleError::Start(err));
        }

        {
            let mut snapshot = self.snapshot();
            snapshot.state = LifecycleState::Started;
            snapshot.started_at = Some(Instant::now());
        }
        status.set(ChannelStatus::Connected);
        tracing::info!("worker started");
        Ok(())
    }

    /// Stop a started worker. Does nothing in any other state.
    pub async fn stop(&self, status: &StatusCell, reason: StopReason) {
        let _transition = self.transition.lock().await;

        let from = self.state();
        if from != LifecycleState::Started {
            tracing::debug!(state = %from, "worker not started, nothing to stop");
            return;
        }

        self.enter(LifecycleState::Stopping);
        status.set(ChannelStatus::Disconnecting);
        self.worker.stop(reason).await;
        {
            let mut snapshot = self.snapshot();
            snapshot.state = LifecycleState::Stopped;
            snapshot.started_at = None;
        }
        status.set(ChannelStatus::Disconnected);
        tracing::info!(?reason, "worker stopped");
    }
}
