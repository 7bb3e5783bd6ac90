//! In-process simulation of a Tunnel Link worker.
//!
//! [`SimulatedTransport`] implements [`Transport`](tunnel_core::Transport)
//! without a real isolated worker. A [`Worker`] is driven through its
//! lifecycle by a [`LifecycleAdapter`], and its messages are answered either
//! by the handlers it registered on the [`Router`] or by the worker directly.
//! [`stdio::serve`] hosts the same worker behind a pipe for the process
//! transport.

mod lifecycle;
mod router;
mod simulated;
pub mod stdio;
mod worker;

pub use lifecycle::{LifecycleAdapter, LifecycleError};
pub use router::{Router, RouterError};
pub use simulated::{Delivery, SimulatedTransport, SimulatorOptions};
pub use worker::{ConfigError, Configuration, StopReason, Worker};

/// Boxed error returned by worker start steps and message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
