//! Fleet Director Shared Types
//!
//! This crate provides the device, command and catalog types shared between
//! the orchestrator core and anything that talks to it, plus the explicit
//! initial-task pipeline state machine.

pub mod catalog;
pub mod command;
pub mod device;
pub mod state_machine;

use chrono::{DateTime, Utc};

pub use catalog::{InstallApplication, Profile, Scope, Subject};
pub use command::{
    CommandHandle, CommandKind, CommandRecord, CommandRequest, CommandSpec, CommandStatus,
    DEVICE_INFORMATION_QUERIES,
};
pub use device::{
    Device, DeviceFlags, DeviceIdentity, DevicePatch, FirmwarePasswordStatus, Flag,
    IdentityMissing, ManagementStatus, OsUpdateSettings, SecurityInfo,
};
pub use state_machine::{Decision, PipelineEvent, PipelineState, PipelineStep};

/// Current wall-clock time in UTC
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Timing and sizing parameters for the orchestrator
pub mod limits {
    /// How many times the device-configured signal is sent per announcement
    pub const DEVICE_CONFIGURED_SENDS: usize = 2;

    /// Relay call timeout in milliseconds
    pub const RELAY_TIMEOUT_MS: u64 = 30_000;

    /// Interval between reconciliation sweeps
    pub const RECONCILE_INTERVAL_SECS: u64 = 300;

    /// Device information older than this is requested again
    pub const INFO_REQUEST_INTERVAL_SECS: u64 = 3600;

    /// Maximum number of devices waiting in the checkin queue
    pub const CHECKIN_QUEUE_CAPACITY: usize = 1024;

    /// Number of checkin queue workers
    pub const CHECKIN_WORKERS: usize = 4;
}
