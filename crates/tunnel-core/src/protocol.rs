//! Built-in protocol messages.
//!
//! Every worker in this workspace understands these. Applications add their
//! own [`Message`] types alongside them.

use crate::{LifecycleState, Message};
use serde::{Deserialize, Serialize};

/// Liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
}

impl Message for Ping {
    const TAG: &'static str = "ping";
}

/// Answer to [`Ping`], carrying the same nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

impl Message for Pong {
    const TAG: &'static str = "pong";
}

/// Text the worker sends back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub text: String,
}

impl Message for Echo {
    const TAG: &'static str = "echo";
}

/// Ask the worker for its current [`ServiceInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfoRequest {
    /// Caller-chosen sequence number, echoed back.
    pub seq: u64,
}

impl Message for ServiceInfoRequest {
    const TAG: &'static str = "service_info_request";
}

/// Worker-reported service state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub seq: u64,
    /// Session name from the worker's configuration.
    pub session: String,
    pub state: LifecycleState,
    pub uptime_ms: u64,
    /// Messages handled since start, including this request.
    pub messages_handled: u64,
}

impl Message for ServiceInfo {
    const TAG: &'static str = "service_info";
}

/// Network settings a worker applies while configuring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Remote endpoint the tunnel talks to.
    pub remote_address: String,
    /// Addresses assigned to the local interface.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Routes sent through the tunnel.
    #[serde(default)]
    pub routes: Vec<String>,
    pub mtu: Option<u16>,
}
