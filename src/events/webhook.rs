//! Webhook payloads delivered by the relay

use chrono::{DateTime, Utc};
use director_shared::{
    CommandStatus, DeviceIdentity, DevicePatch, FirmwarePasswordStatus, Flag, IdentityMissing,
    ManagementStatus, OsUpdateSettings, SecurityInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TOPIC_AUTHENTICATE: &str = "mdm.Authenticate";
pub const TOPIC_TOKEN_UPDATE: &str = "mdm.TokenUpdate";
pub const TOPIC_CHECK_OUT: &str = "mdm.CheckOut";
pub const TOPIC_CONNECT: &str = "mdm.Connect";

/// Envelope for every inbound notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub topic: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkin_event: Option<CheckinEvent>,
    #[serde(default)]
    pub acknowledge_event: Option<AcknowledgeEvent>,
}

/// Enrollment and check-in messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckinEvent {
    #[serde(default)]
    pub udid: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub awaiting_configuration: bool,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub build_version: Option<String>,
}

impl CheckinEvent {
    pub fn identity(&self) -> Result<DeviceIdentity, IdentityMissing> {
        DeviceIdentity::new(self.udid.clone(), self.serial_number.clone())
    }

    /// Attributes carried by the message, without any flags
    pub fn attributes(&self) -> DevicePatch {
        let mut patch = DevicePatch::new();
        patch.product_name = self.product_name.clone();
        patch.model = self.model.clone();
        patch.device_name = self.device_name.clone();
        patch.os_version = self.os_version.clone();
        patch.build_version = self.build_version.clone();
        patch
    }
}

/// Status reported by the device for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Acknowledged,
    Error,
    CommandFormatError,
    NotNow,
    /// The device checked in with nothing to report
    Idle,
}

impl AckStatus {
    /// Command status this maps to; `None` for idle check-ins
    pub fn command_status(self) -> Option<CommandStatus> {
        match self {
            AckStatus::Acknowledged => Some(CommandStatus::Acknowledged),
            AckStatus::Error | AckStatus::CommandFormatError => Some(CommandStatus::Error),
            AckStatus::NotNow => Some(CommandStatus::Pending),
            AckStatus::Idle => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorChainItem {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_domain: String,
    #[serde(default)]
    pub localized_description: String,
}

/// A command result, or an idle check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcknowledgeEvent {
    pub udid: String,
    pub status: AckStatus,
    #[serde(default)]
    pub command_uuid: String,
    #[serde(default)]
    pub error_chain: Vec<ErrorChainItem>,
    /// DeviceInformation response body
    #[serde(default)]
    pub query_responses: Option<Map<String, Value>>,
    #[serde(default)]
    pub security_info: Option<SecurityInfoResponse>,
    #[serde(default)]
    pub profile_list: Option<Vec<ProfileListItem>>,
}

impl AcknowledgeEvent {
    /// Error chain flattened for storage
    pub fn error_message(&self) -> Option<String> {
        if self.error_chain.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .error_chain
            .iter()
            .map(|e| format!("{} ({} {})", e.localized_description, e.error_domain, e.error_code))
            .collect();
        Some(parts.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileListItem {
    #[serde(rename = "PayloadIdentifier")]
    pub payload_identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityInfoResponse {
    #[serde(rename = "HardwareEncryptionCaps")]
    pub hardware_encryption_caps: i64,
    #[serde(rename = "PasscodePresent")]
    pub passcode_present: bool,
    #[serde(rename = "PasscodeCompliant")]
    pub passcode_compliant: bool,
    #[serde(rename = "FDE_Enabled")]
    pub fde_enabled: bool,
    #[serde(rename = "FirmwarePasswordStatus")]
    pub firmware_password_status: Option<FirmwarePasswordStatusResponse>,
    #[serde(rename = "ManagementStatus")]
    pub management_status: Option<ManagementStatusResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwarePasswordStatusResponse {
    #[serde(rename = "PasswordExists")]
    pub password_exists: bool,
    #[serde(rename = "ChangePending")]
    pub change_pending: bool,
    #[serde(rename = "AllowOroms")]
    pub allow_oroms: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementStatusResponse {
    #[serde(rename = "EnrolledViaDEP")]
    pub enrolled_via_dep: bool,
    #[serde(rename = "UserApprovedEnrollment")]
    pub user_approved_enrollment: bool,
    #[serde(rename = "IsUserEnrollment")]
    pub is_user_enrollment: bool,
}

impl From<SecurityInfoResponse> for SecurityInfo {
    fn from(r: SecurityInfoResponse) -> Self {
        Self {
            hardware_encryption_caps: r.hardware_encryption_caps,
            passcode_present: r.passcode_present,
            passcode_compliant: r.passcode_compliant,
            filevault_enabled: r.fde_enabled,
            firmware_password_status: r.firmware_password_status.map(|s| FirmwarePasswordStatus {
                password_exists: s.password_exists,
                change_pending: s.change_pending,
                allow_oroms: s.allow_oroms,
            }),
            management_status: r.management_status.map(|s| ManagementStatus {
                enrolled_via_dep: s.enrolled_via_dep,
                user_approved_enrollment: s.user_approved_enrollment,
                is_user_enrollment: s.is_user_enrollment,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct OsUpdateSettingsResponse {
    #[serde(rename = "CatalogURL")]
    catalog_url: Option<String>,
    #[serde(rename = "AutomaticCheckEnabled")]
    automatic_check_enabled: bool,
    #[serde(rename = "BackgroundDownloadEnabled")]
    background_download_enabled: bool,
    #[serde(rename = "AutomaticAppInstallationEnabled")]
    automatic_app_installation_enabled: bool,
    #[serde(rename = "AutomaticOSInstallationEnabled")]
    automatic_os_installation_enabled: bool,
    #[serde(rename = "AutomaticSecurityUpdatesEnabled")]
    automatic_security_updates_enabled: bool,
}

/// Fold a DeviceInformation response into the fields it reports
pub fn device_information_patch(responses: &Map<String, Value>) -> DevicePatch {
    let mut patch = DevicePatch::new();

    for flag in Flag::ALL {
        let Some(key) = flag.query_key() else {
            continue;
        };
        if let Some(value) = responses.get(key).and_then(Value::as_bool) {
            patch.flags.insert(flag, value);
        }
    }

    let text = |key: &str| responses.get(key).and_then(Value::as_str).map(str::to_string);
    patch.product_name = text("ProductName");
    patch.model = text("Model");
    patch.device_name = text("DeviceName");
    patch.os_version = text("OSVersion");
    patch.build_version = text("BuildVersion");

    patch.os_update_settings = responses
        .get("OSUpdateSettings")
        .cloned()
        .and_then(|v| serde_json::from_value::<OsUpdateSettingsResponse>(v).ok())
        .map(|s| OsUpdateSettings {
            catalog_url: s.catalog_url,
            automatic_check_enabled: s.automatic_check_enabled,
            background_download_enabled: s.background_download_enabled,
            automatic_app_installation_enabled: s.automatic_app_installation_enabled,
            automatic_os_installation_enabled: s.automatic_os_installation_enabled,
            automatic_security_updates_enabled: s.automatic_security_updates_enabled,
        });

    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_token_update() {
        let body = json!({
            "topic": "mdm.TokenUpdate",
            "event_id": "e1",
            "created_at": "2024-05-01T10:00:00Z",
            "checkin_event": {"udid": "ABC", "awaiting_configuration": true}
        });

        let webhook: Webhook = serde_json::from_value(body).unwrap();

        assert_eq!(webhook.topic, TOPIC_TOKEN_UPDATE);
        let checkin = webhook.checkin_event.unwrap();
        assert!(checkin.awaiting_configuration);
        assert_eq!(checkin.identity().unwrap(), DeviceIdentity::udid("ABC"));
    }

    #[test]
    fn test_device_information_patch() {
        let responses = json!({
            "AwaitingConfiguration": true,
            "IsSupervised": true,
            "BuildVersion": "21A5",
            "OSUpdateSettings": {"AutomaticCheckEnabled": true, "CatalogURL": "https://su.example"}
        });

        let patch = device_information_patch(responses.as_object().unwrap());

        assert_eq!(patch.flags.get(&Flag::AwaitingConfiguration), Some(&true));
        assert_eq!(patch.flags.get(&Flag::Supervised), Some(&true));
        assert!(!patch.flags.contains_key(&Flag::InitialTasksRun));
        assert_eq!(patch.build_version.as_deref(), Some("21A5"));
        let settings = patch.os_update_settings.unwrap();
        assert!(settings.automatic_check_enabled);
        assert_eq!(settings.catalog_url.as_deref(), Some("https://su.example"));
    }

    #[test]
    fn test_security_info_conversion() {
        let response: SecurityInfoResponse = serde_json::from_value(json!({
            "FDE_Enabled": true,
            "ManagementStatus": {"EnrolledViaDEP": true}
        }))
        .unwrap();

        let info = SecurityInfo::from(response);

        assert!(info.filevault_enabled);
        assert!(info.management_status.unwrap().enrolled_via_dep);
        assert!(info.firmware_password_status.is_none());
    }

    #[test]
    fn test_error_chain_flattened() {
        let ack: AcknowledgeEvent = serde_json::from_value(json!({
            "udid": "ABC",
            "status": "Error",
            "command_uuid": "c1",
            "error_chain": [{"error_code": 4, "error_domain": "MCProfile", "localized_description": "bad"}]
        }))
        .unwrap();

        assert_eq!(ack.status.command_status(), Some(CommandStatus::Error));
        assert_eq!(ack.error_message().as_deref(), Some("bad (MCProfile 4)"));
    }
}
