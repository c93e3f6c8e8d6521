//! Relay abstraction for pluggable command egress
//!
//! The relay owns the device-management session and executes commands
//! asynchronously; results come back later as inbound acknowledgements.

mod http;
mod simulated;

pub use http::HttpRelay;
pub use simulated::{SentCommand, SimulatedRelay};

use crate::config::{RelayConfig, RelayMode};
use anyhow::Result;
use async_trait::async_trait;
use director_shared::CommandRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A device as the relay knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDevice {
    #[serde(default)]
    pub udid: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub enrollment_status: bool,
}

/// Outbound side of the relay
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Queue one command, returning the relay-assigned command UUID
    async fn enqueue(&self, request: &CommandRequest) -> Result<String>;

    /// Every device the relay has a record of
    async fn list_devices(&self) -> Result<Vec<RelayDevice>>;

    /// Human-readable name for this relay
    fn name(&self) -> &'static str;
}

/// Build the relay selected by the configuration
pub fn connect(config: &RelayConfig) -> Result<Arc<dyn RelayClient>> {
    match config.mode {
        RelayMode::Http => Ok(Arc::new(HttpRelay::new(config)?)),
        RelayMode::Simulated => Ok(Arc::new(SimulatedRelay::new())),
    }
}
