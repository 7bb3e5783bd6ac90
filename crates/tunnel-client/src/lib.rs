//! Host-side implementation of the Tunnel Link protocol.
//!
//! [`CommunicationMonitor`] performs typed round trips over whichever
//! [`Transport`](tunnel_core::Transport) is bound to it and supervises
//! periodic polling. [`ProcessTransport`] is the real transport: a worker
//! running as a child process.

mod monitor;
mod process;

pub use monitor::{
    CommunicationMonitor, MIN_POLL_INTERVAL, MonitorConfig, OverlapPolicy, WeakMonitor,
};
pub use process::{ProcessCommand, ProcessTransport, START_OPTIONS_ENV};

use std::time::Duration;
use tunnel_core::{ChannelStatus, CodecError, TransportError};

/// Why a round trip failed.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("no transport bound to the monitor")]
    InvalidExtension,
    #[error("channel is {0}, not connected")]
    InvalidState(ChannelStatus),
    #[error("cannot encode request: {0}")]
    ContainerSerialization(#[source] CodecError),
    #[error("transport failed to send: {0}")]
    SendFailure(#[source] TransportError),
    #[error("worker completed without a response")]
    NilResponse,
    #[error("cannot decode response: {0}")]
    ResponseDecoding(#[source] CodecError),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}
