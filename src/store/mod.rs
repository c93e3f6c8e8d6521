//! Storage access contract
//!
//! The orchestrator only relies on these traits. Implementations are
//! expected to bound their own I/O; the bundled [`MemoryStore`] never blocks
//! beyond lock contention.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use director_shared::{
    CommandRecord, CommandStatus, Device, DeviceIdentity, DevicePatch, InstallApplication,
    Profile, Scope,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Durable record of every known device
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Look a device up by UDID first, then serial number
    async fn get(&self, identity: &DeviceIdentity) -> Result<Device>;

    async fn get_by_id(&self, id: Uuid) -> Result<Device>;

    /// Create the device if absent, otherwise merge the patch into the existing row
    async fn upsert(&self, identity: &DeviceIdentity, patch: &DevicePatch) -> Result<Device>;

    /// Write the named fields of an existing device
    async fn patch_flags(&self, identity: &DeviceIdentity, patch: &DevicePatch)
        -> Result<Device>;

    async fn list(&self) -> Result<Vec<Device>>;
}

/// Which command records to return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFilter {
    pub device_id: Option<Uuid>,
    pub status: Option<CommandStatus>,
}

impl CommandFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn pending() -> Self {
        Self {
            device_id: None,
            status: Some(CommandStatus::Pending),
        }
    }

    pub fn errors() -> Self {
        Self {
            device_id: None,
            status: Some(CommandStatus::Error),
        }
    }

    pub fn for_device(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn matches(&self, record: &CommandRecord) -> bool {
        self.device_id.map_or(true, |id| record.device_id == id)
            && self.status.map_or(true, |status| record.status == status)
    }
}

/// Commands sent to the relay, keyed by relay-assigned UUID
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn record(&self, command: CommandRecord) -> Result<()>;

    async fn find(&self, command_uuid: &str) -> Result<Option<CommandRecord>>;

    async fn find_intent(&self, intent: Uuid) -> Result<Option<CommandRecord>>;

    /// Reserve an intent before its destructive command is dispatched. Returns
    /// false when the intent is already reserved or recorded.
    async fn claim_intent(&self, intent: Uuid) -> Result<bool>;

    /// Give a reservation back after a dispatch that never reached the relay
    async fn release_intent(&self, intent: Uuid) -> Result<()>;

    /// Move a pending command to its final status. Returns the record when it
    /// changed, `None` when it is unknown or already final.
    async fn complete(
        &self,
        command_uuid: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<Option<CommandRecord>>;

    /// Drop every pending command for a device, returning how many went
    async fn discard_pending(&self, device_id: Uuid) -> Result<usize>;

    async fn list(&self, filter: CommandFilter) -> Result<Vec<CommandRecord>>;
}

/// Profile and application assignment plus what is known to be installed
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Monotonic revision bumped by every assignment change
    async fn revision(&self) -> Result<u64>;

    async fn put_profile(&self, scope: Scope, profile: Profile) -> Result<u64>;

    async fn remove_profile(&self, scope: Scope, identifier: &str) -> Result<bool>;

    async fn profiles_in(&self, scope: Scope) -> Result<Vec<Profile>>;

    /// Effective profile set for a device: shared plus device scope, device wins
    async fn profiles_for(&self, device_id: Uuid) -> Result<Vec<Profile>>;

    async fn put_application(&self, scope: Scope, application: InstallApplication)
        -> Result<u64>;

    async fn applications_in(&self, scope: Scope) -> Result<Vec<InstallApplication>>;

    async fn applications_for(&self, device_id: Uuid) -> Result<Vec<InstallApplication>>;

    /// Installed subjects on a device: identifier to content hash
    async fn installed(&self, device_id: Uuid) -> Result<HashMap<String, String>>;

    async fn mark_installed(&self, device_id: Uuid, identifier: &str, hash: &str) -> Result<()>;

    /// Drop installed markers, e.g. for profiles the device no longer reports
    async fn forget_installed(&self, device_id: Uuid, identifiers: &[String]) -> Result<()>;

    async fn clear_installed(&self, device_id: Uuid) -> Result<()>;
}
