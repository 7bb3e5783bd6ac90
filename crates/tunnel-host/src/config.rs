//! Host configuration, loaded from TOML.
//!
//! Every section is optional:
//!
//! ```toml
//! [transport]
//! kind = "process"          # or "simulated"
//! program = "tunnel-worker"
//! args = ["--config", "host.toml"]
//!
//! [monitor]
//! interval_ms = 1000
//! request_timeout_ms = 5000
//! overlap = "skip_while_outstanding"
//! drop_stale_responses = true
//!
//! [worker]
//! session = "lab"
//! remote_address = "192.0.2.1"
//! ```

use crate::demo::DemoConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunnel_client::{MonitorConfig, OverlapPolicy, ProcessCommand};
use tunnel_sim::Delivery;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub transport: TransportConfig,
    pub monitor: MonitorSection,
    pub worker: DemoConfig,
}

/// Which transport the host talks through.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process demo worker.
    Simulated {
        #[serde(default)]
        delivery: Delivery,
    },
    /// Worker running as a child process.
    Process(ProcessCommand),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Simulated {
            delivery: Delivery::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub overlap: OverlapPolicy,
    pub drop_stale_responses: bool,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            request_timeout_ms: Some(5000),
            overlap: OverlapPolicy::default(),
            drop_stale_responses: false,
        }
    }
}

impl MonitorSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            overlap: self.overlap,
            drop_stale_responses: self.drop_stale_responses,
        }
    }
}

impl HostConfig {
    /// Load from `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, LoadError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
