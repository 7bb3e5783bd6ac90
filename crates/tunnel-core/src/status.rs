//! Channel status, worker lifecycle state, and status observers.

use crate::protocol::ServiceInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Status of the channel between host and worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// No session has been set up yet.
    #[default]
    Invalid,
    Connecting,
    /// The only status in which messages may be sent.
    Connected,
    /// Recovering after a transient loss.
    Reasserting,
    Disconnecting,
    Disconnected,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Invalid => "invalid",
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Reasserting => "reasserting",
            ChannelStatus::Disconnecting => "disconnecting",
            ChannelStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == ChannelStatus::Connected
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a simulated worker, independent of [`ChannelStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Configuring,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Configuring => "configuring",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives channel and service notifications.
///
/// Callbacks run synchronously on the thread that caused the transition.
/// They must not mutate the status they are observing.
pub trait Observer: Send + Sync {
    fn channel_status_changed(&self, status: ChannelStatus) {
        let _ = status;
    }

    fn service_state_changed(&self, info: &ServiceInfo) {
        let _ = info;
    }
}

/// Mutex-guarded owner of a [`ChannelStatus`].
///
/// Reads return a snapshot. Writers are serialized so observers see every
/// transition in order, but the status itself is unlocked while observers
/// run and they may read it back.
#[derive(Default)]
pub struct StatusCell {
    status: Mutex<ChannelStatus>,
    /// Held across a write and its notifications.
    notify: Mutex<()>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ChannelStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, notifying observers. Setting the current value is a no-op.
    ///
    /// Observers must not call `set` on the same cell from their callback.
    pub fn set(&self, next: ChannelStatus) {
        let _notify = self.notify.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status == next {
                return;
            }
            tracing::debug!(from = %*status, to = %next, "channel status changed");
            *status = next;
        }

        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.channel_status_changed(next);
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }
}

/// Observer that records every status it sees. Useful in tests and CLIs.
#[derive(Default)]
pub struct StatusLog {
    seen: Mutex<Vec<ChannelStatus>>,
}

impl StatusLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<ChannelStatus> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Observer for StatusLog {
    fn channel_status_changed(&self, status: ChannelStatus) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status);
    }
}
