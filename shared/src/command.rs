//! Commands sent to devices through the relay

use crate::catalog::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Queries sent with every DeviceInformation request
pub const DEVICE_INFORMATION_QUERIES: &[&str] = &[
    "DeviceName",
    "ProductName",
    "Model",
    "SerialNumber",
    "OSVersion",
    "BuildVersion",
    "IsSupervised",
    "IsDeviceLocatorServiceEnabled",
    "IsActivationLockEnabled",
    "IsDoNotDisturbInEffect",
    "IsCloudBackupEnabled",
    "SystemIntegrityProtectionEnabled",
    "AppAnalyticsEnabled",
    "IsMDMLostModeEnabled",
    "AwaitingConfiguration",
    "DiagnosticSubmissionEnabled",
    "IsMultiUser",
    "OSUpdateSettings",
];

/// Kinds of command the orchestrator issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    DeviceInformation,
    SecurityInfo,
    ProfileList,
    InstallProfile,
    RemoveProfile,
    InstallEnterpriseApplication,
    DeviceConfigured,
    DeviceLock,
    EraseDevice,
}

impl CommandKind {
    /// Request type understood by the relay
    pub fn request_type(self) -> &'static str {
        match self {
            CommandKind::DeviceInformation => "DeviceInformation",
            CommandKind::SecurityInfo => "SecurityInfo",
            CommandKind::ProfileList => "ProfileList",
            CommandKind::InstallProfile => "InstallProfile",
            CommandKind::RemoveProfile => "RemoveProfile",
            CommandKind::InstallEnterpriseApplication => "InstallEnterpriseApplication",
            CommandKind::DeviceConfigured => "DeviceConfigured",
            CommandKind::DeviceLock => "DeviceLock",
            CommandKind::EraseDevice => "EraseDevice",
        }
    }

    /// Commands that must not run twice for the same logical intent
    pub fn is_destructive(self) -> bool {
        matches!(self, CommandKind::EraseDevice | CommandKind::DeviceLock)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request_type())
    }
}

/// Lifecycle of a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Error,
}

impl CommandStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }
}

/// What a caller wants sent; the gateway turns this into a relay request and a record
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub kind: CommandKind,
    pub payload: Map<String, Value>,
    /// Profile or application the command installs or removes
    pub subject: Option<Subject>,
    /// Logical intent for destructive commands
    pub intent: Option<Uuid>,
}

impl CommandSpec {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
            subject: None,
            intent: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn intent(mut self, intent: Uuid) -> Self {
        self.intent = Some(intent);
        self
    }
}

/// Body of one outbound relay call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub udid: String,
    pub request_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(udid: impl Into<String>, spec: &CommandSpec) -> Self {
        Self {
            udid: udid.into(),
            request_type: spec.kind.request_type().to_string(),
            payload: spec.payload.clone(),
        }
    }
}

/// Correlation handle returned when a command is dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHandle {
    pub command_uuid: String,
    pub kind: CommandKind,
}

/// Stored record of a dispatched command, keyed by the relay-assigned UUID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_uuid: String,
    pub device_id: Uuid,
    pub udid: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub payload: Map<String, Value>,
    pub subject: Option<Subject>,
    pub intent: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            command_uuid: self.command_uuid.clone(),
            kind: self.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_flattens_payload() {
        let spec = CommandSpec::new(CommandKind::DeviceInformation)
            .field("queries", json!(["IsSupervised"]));
        let request = CommandRequest::new("ABC", &spec);

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "udid": "ABC",
                "request_type": "DeviceInformation",
                "queries": ["IsSupervised"],
            })
        );
    }

    #[test]
    fn test_destructive_kinds() {
        assert!(CommandKind::EraseDevice.is_destructive());
        assert!(CommandKind::DeviceLock.is_destructive());
        assert!(!CommandKind::DeviceInformation.is_destructive());
        assert!(!CommandKind::DeviceConfigured.is_destructive());
    }
}
