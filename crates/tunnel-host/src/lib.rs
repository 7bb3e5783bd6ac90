//! Shared pieces of the `tunnel-host` and `tunnel-worker` binaries.

pub mod config;
pub mod demo;

use config::{HostConfig, TransportConfig};
use demo::DemoWorker;
use std::sync::Arc;
use tunnel_client::ProcessTransport;
use tunnel_core::protocol::ServiceInfo;
use tunnel_core::{ChannelStatus, Observer, Transport};
use tunnel_sim::{SimulatedTransport, SimulatorOptions};

/// Build the transport named by `config`.
pub fn build_transport(config: &HostConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match &config.transport {
        TransportConfig::Simulated { delivery } => {
            let options = SimulatorOptions {
                user_config: Some(config.worker.to_user_config()?),
                delivery: *delivery,
            };
            Arc::new(SimulatedTransport::new(Arc::new(DemoWorker::new()), options))
        }
        TransportConfig::Process(command) => Arc::new(ProcessTransport::new(command.clone())),
    };
    Ok(transport)
}

/// Logs every notification it receives.
pub struct LogObserver;

impl Observer for LogObserver {
    fn channel_status_changed(&self, status: ChannelStatus) {
        tracing::info!(%status, "channel status changed");
    }

    fn service_state_changed(&self, info: &ServiceInfo) {
        tracing::info!(
            seq = info.seq,
            session = %info.session,
            state = %info.state,
            uptime_ms = info.uptime_ms,
            handled = info.messages_handled,
            "service state"
        );
    }
}
