//! A small worker that answers the built-in protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tunnel_core::protocol::{Echo, Ping, Pong, ServiceInfo, ServiceInfoRequest, TunnelSettings};
use tunnel_core::{LifecycleState, StartOptions, decode, encode};
use tunnel_sim::{BoxError, ConfigError, Configuration, StopReason, Worker};

/// User configuration understood by [`DemoWorker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub session: String,
    pub remote_address: String,
    pub routes: Vec<String>,
    /// Refuse to start. For exercising the failure path.
    pub fail_start: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            session: "default".into(),
            remote_address: "192.0.2.1".into(),
            routes: Vec::new(),
            fail_start: false,
        }
    }
}

impl DemoConfig {
    /// The opaque bytes handed to the worker's configure step.
    pub fn to_user_config(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Default)]
pub struct DemoWorker {
    state: Arc<DemoState>,
}

#[derive(Default)]
struct DemoState {
    config: Mutex<DemoConfig>,
    started_at: Mutex<Option<Instant>>,
    handled: AtomicU64,
}

impl DemoState {
    fn service_info(&self, seq: u64) -> ServiceInfo {
        let started_at = *self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (state, uptime_ms) = match started_at {
            Some(at) => (LifecycleState::Started, at.elapsed().as_millis() as u64),
            None => (LifecycleState::Stopped, 0),
        };
        ServiceInfo {
            seq,
            session: self
                .config
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .session
                .clone(),
            state,
            uptime_ms,
            messages_handled: self.handled.load(Ordering::SeqCst),
        }
    }

    fn count(&self) {
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

impl DemoWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_handled(&self) -> u64 {
        self.state.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for DemoWorker {
    async fn configure(&self, configuration: &mut Configuration<'_>) -> Result<(), ConfigError> {
        let config: DemoConfig = configuration.user_config_as()?.unwrap_or_default();
        if config.session.is_empty() {
            return Err(ConfigError::Invalid("session name is empty".into()));
        }

        configuration.apply_settings(TunnelSettings {
            remote_address: config.remote_address.clone(),
            addresses: vec!["10.8.0.2/32".into()],
            routes: config.routes.clone(),
            mtu: Some(1400),
        });
        *self
            .state
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config;

        let router = configuration.router();

        let state = self.state.clone();
        router.register(move |ping: Ping| {
            state.count();
            async move { Ok(Pong { nonce: ping.nonce }) }
        });

        let state = self.state.clone();
        router.register(move |echo: Echo| {
            state.count();
            async move { Ok(echo) }
        });

        let state = self.state.clone();
        router.register(move |request: ServiceInfoRequest| {
            state.count();
            let info = state.service_info(request.seq);
            async move { Ok(info) }
        });

        Ok(())
    }

    async fn start(&self, _options: &StartOptions) -> Result<(), BoxError> {
        let (session, fail) = {
            let config = self
                .state
                .config
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (config.session.clone(), config.fail_start)
        };
        if fail {
            return Err(format!("session `{session}` is configured to fail").into());
        }

        *self
            .state
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        tracing::info!(%session, "demo worker started");
        Ok(())
    }

    async fn stop(&self, reason: StopReason) {
        self.state
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!(?reason, "demo worker stopped");
    }

    /// Direct delivery answers pings and echoes without going through a router.
    async fn handle_message(&self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.state.count();
        if let Ok(ping) = decode::<Ping>(&bytes) {
            return encode(&Pong { nonce: ping.nonce }).ok();
        }
        if let Ok(request) = decode::<ServiceInfoRequest>(&bytes) {
            return encode(&self.state.service_info(request.seq)).ok();
        }
        decode::<Echo>(&bytes).ok().and_then(|echo| encode(&echo).ok())
    }
}
