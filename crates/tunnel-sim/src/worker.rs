//! The worker side of the channel.

use crate::{BoxError, Router};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tunnel_core::StartOptions;
use tunnel_core::protocol::TunnelSettings;

/// A tunnel worker driven through configure, start and stop.
///
/// Workers that answer through the [`Router`] register their handlers in
/// [`configure`](Worker::configure). Workers that want raw bytes override
/// [`handle_message`](Worker::handle_message) and are run with
/// [`Delivery::Direct`](crate::Delivery::Direct).
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn configure(&self, configuration: &mut Configuration<'_>) -> Result<(), ConfigError>;

    async fn start(&self, options: &StartOptions) -> Result<(), BoxError>;

    async fn stop(&self, reason: StopReason);

    async fn handle_message(&self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        tracing::debug!(len = bytes.len(), "worker ignores raw messages");
        None
    }
}

/// What a worker gets to look at and touch while configuring.
pub struct Configuration<'a> {
    user_config: Option<&'a [u8]>,
    router: &'a Router,
    settings: Option<TunnelSettings>,
}

impl<'a> Configuration<'a> {
    pub fn new(user_config: Option<&'a [u8]>, router: &'a Router) -> Self {
        Self {
            user_config,
            router,
            settings: None,
        }
    }

    /// Opaque provider configuration supplied by the host.
    pub fn user_config(&self) -> Option<&'a [u8]> {
        self.user_config
    }

    /// Parse the user configuration as JSON.
    pub fn user_config_as<T: DeserializeOwned>(&self) -> Result<Option<T>, ConfigError> {
        self.user_config
            .map(serde_json::from_slice)
            .transpose()
            .map_err(ConfigError::Malformed)
    }

    pub fn router(&self) -> &'a Router {
        self.router
    }

    /// Record the network settings this worker wants applied.
    pub fn apply_settings(&mut self, settings: TunnelSettings) {
        tracing::debug!(remote = %settings.remote_address, "tunnel settings applied");
        self.settings = Some(settings);
    }

    pub fn into_settings(self) -> Option<TunnelSettings> {
        self.settings
    }
}

/// Why a worker is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The host asked for it.
    Requested,
    /// The host is going away (e.g. its input closed).
    HostShutdown,
}

/// Error raised while configuring a worker.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("user configuration is missing")]
    Missing,
    #[error("malformed user configuration: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
