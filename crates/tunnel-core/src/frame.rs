//! Line framing for the host/worker process channel.
//!
//! The worker's first line is a [`Handshake`] reporting whether it started.
//! After that, one JSON object per line: `{"body": [..bytes..]}` or
//! `{"body": null}`. The worker answers frames strictly in the order it reads
//! them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub body: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(body: Option<Vec<u8>>) -> Self {
        Self { body }
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

/// Sent once by the worker after its configure and start steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "handshake", rename_all = "snake_case")]
pub enum Handshake {
    Ready,
    Failed { error: String },
}

impl Handshake {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
