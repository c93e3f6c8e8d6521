//! Device records, identities and partial updates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Neither a UDID nor a serial number was supplied
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No device UDID or serial number set")]
pub struct IdentityMissing;

/// How a device is addressed: UDID once known, serial number before that
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    /// Build an identity, treating empty strings as absent
    pub fn new(
        udid: Option<String>,
        serial_number: Option<String>,
    ) -> Result<Self, IdentityMissing> {
        let identity = Self {
            udid: udid.filter(|u| !u.is_empty()),
            serial_number: serial_number.filter(|s| !s.is_empty()),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn udid(udid: impl Into<String>) -> Self {
        Self {
            udid: Some(udid.into()),
            serial_number: None,
        }
    }

    pub fn serial(serial_number: impl Into<String>) -> Self {
        Self {
            udid: None,
            serial_number: Some(serial_number.into()),
        }
    }

    /// Reject identities that carry no usable key
    pub fn validate(&self) -> Result<(), IdentityMissing> {
        let has_udid = self.udid.as_deref().is_some_and(|u| !u.is_empty());
        let has_serial = self.serial_number.as_deref().is_some_and(|s| !s.is_empty());
        if has_udid || has_serial {
            Ok(())
        } else {
            Err(IdentityMissing)
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.udid, &self.serial_number) {
            (Some(udid), _) => write!(f, "udid={}", udid),
            (None, Some(serial)) => write!(f, "serial={}", serial),
            (None, None) => write!(f, "<no identity>"),
        }
    }
}

/// Independent boolean state flags stored per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Supervised,
    DeviceLocatorServiceEnabled,
    ActivationLockEnabled,
    DoNotDisturbInEffect,
    CloudBackupEnabled,
    SystemIntegrityProtectionEnabled,
    AppAnalyticsEnabled,
    MdmLostModeEnabled,
    AwaitingConfiguration,
    DiagnosticSubmissionEnabled,
    MultiUser,
    InitialTasksRun,
    TokenUpdateReceived,
    AuthenticateReceived,
}

impl Flag {
    pub const ALL: [Flag; 14] = [
        Flag::Supervised,
        Flag::DeviceLocatorServiceEnabled,
        Flag::ActivationLockEnabled,
        Flag::DoNotDisturbInEffect,
        Flag::CloudBackupEnabled,
        Flag::SystemIntegrityProtectionEnabled,
        Flag::AppAnalyticsEnabled,
        Flag::MdmLostModeEnabled,
        Flag::AwaitingConfiguration,
        Flag::DiagnosticSubmissionEnabled,
        Flag::MultiUser,
        Flag::InitialTasksRun,
        Flag::TokenUpdateReceived,
        Flag::AuthenticateReceived,
    ];

    /// Key used by the relay's DeviceInformation query responses, if the flag is reported there
    pub fn query_key(self) -> Option<&'static str> {
        match self {
            Flag::Supervised => Some("IsSupervised"),
            Flag::DeviceLocatorServiceEnabled => Some("IsDeviceLocatorServiceEnabled"),
            Flag::ActivationLockEnabled => Some("IsActivationLockEnabled"),
            Flag::DoNotDisturbInEffect => Some("IsDoNotDisturbInEffect"),
            Flag::CloudBackupEnabled => Some("IsCloudBackupEnabled"),
            Flag::SystemIntegrityProtectionEnabled => Some("SystemIntegrityProtectionEnabled"),
            Flag::AppAnalyticsEnabled => Some("AppAnalyticsEnabled"),
            Flag::MdmLostModeEnabled => Some("IsMDMLostModeEnabled"),
            Flag::AwaitingConfiguration => Some("AwaitingConfiguration"),
            Flag::DiagnosticSubmissionEnabled => Some("DiagnosticSubmissionEnabled"),
            Flag::MultiUser => Some("IsMultiUser"),
            Flag::InitialTasksRun | Flag::TokenUpdateReceived | Flag::AuthenticateReceived => {
                None
            }
        }
    }
}

/// Flag values for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceFlags {
    pub is_supervised: bool,
    pub is_device_locator_service_enabled: bool,
    pub is_activation_lock_enabled: bool,
    pub is_do_not_disturb_in_effect: bool,
    pub is_cloud_backup_enabled: bool,
    pub system_integrity_protection_enabled: bool,
    pub app_analytics_enabled: bool,
    pub is_mdm_lost_mode_enabled: bool,
    pub awaiting_configuration: bool,
    pub diagnostic_submission_enabled: bool,
    pub is_multi_user: bool,
    pub initial_tasks_run: bool,
    pub token_update_received: bool,
    pub authenticate_received: bool,
}

impl DeviceFlags {
    pub fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::Supervised => self.is_supervised,
            Flag::DeviceLocatorServiceEnabled => self.is_device_locator_service_enabled,
            Flag::ActivationLockEnabled => self.is_activation_lock_enabled,
            Flag::DoNotDisturbInEffect => self.is_do_not_disturb_in_effect,
            Flag::CloudBackupEnabled => self.is_cloud_backup_enabled,
            Flag::SystemIntegrityProtectionEnabled => self.system_integrity_protection_enabled,
            Flag::AppAnalyticsEnabled => self.app_analytics_enabled,
            Flag::MdmLostModeEnabled => self.is_mdm_lost_mode_enabled,
            Flag::AwaitingConfiguration => self.awaiting_configuration,
            Flag::DiagnosticSubmissionEnabled => self.diagnostic_submission_enabled,
            Flag::MultiUser => self.is_multi_user,
            Flag::InitialTasksRun => self.initial_tasks_run,
            Flag::TokenUpdateReceived => self.token_update_received,
            Flag::AuthenticateReceived => self.authenticate_received,
        }
    }

    pub fn set(&mut self, flag: Flag, value: bool) {
        let slot = match flag {
            Flag::Supervised => &mut self.is_supervised,
            Flag::DeviceLocatorServiceEnabled => &mut self.is_device_locator_service_enabled,
            Flag::ActivationLockEnabled => &mut self.is_activation_lock_enabled,
            Flag::DoNotDisturbInEffect => &mut self.is_do_not_disturb_in_effect,
            Flag::CloudBackupEnabled => &mut self.is_cloud_backup_enabled,
            Flag::SystemIntegrityProtectionEnabled => {
                &mut self.system_integrity_protection_enabled
            }
            Flag::AppAnalyticsEnabled => &mut self.app_analytics_enabled,
            Flag::MdmLostModeEnabled => &mut self.is_mdm_lost_mode_enabled,
            Flag::AwaitingConfiguration => &mut self.awaiting_configuration,
            Flag::DiagnosticSubmissionEnabled => &mut self.diagnostic_submission_enabled,
            Flag::MultiUser => &mut self.is_multi_user,
            Flag::InitialTasksRun => &mut self.initial_tasks_run,
            Flag::TokenUpdateReceived => &mut self.token_update_received,
            Flag::AuthenticateReceived => &mut self.authenticate_received,
        };
        *slot = value;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwarePasswordStatus {
    pub password_exists: bool,
    pub change_pending: bool,
    pub allow_oroms: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManagementStatus {
    pub enrolled_via_dep: bool,
    pub user_approved_enrollment: bool,
    pub is_user_enrollment: bool,
}

/// Security sub-record reported by a SecurityInfo response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub hardware_encryption_caps: i64,
    pub passcode_present: bool,
    pub passcode_compliant: bool,
    pub filevault_enabled: bool,
    pub firmware_password_status: Option<FirmwarePasswordStatus>,
    pub management_status: Option<ManagementStatus>,
}

/// Software update settings reported by a DeviceInformation response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OsUpdateSettings {
    pub catalog_url: Option<String>,
    pub automatic_check_enabled: bool,
    pub background_download_enabled: bool,
    pub automatic_app_installation_enabled: bool,
    pub automatic_os_installation_enabled: bool,
    pub automatic_security_updates_enabled: bool,
}

/// Authoritative record for one enrolled or pre-enrolled device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub udid: Option<String>,
    pub serial_number: Option<String>,
    pub flags: DeviceFlags,
    pub product_name: Option<String>,
    pub model: Option<String>,
    pub device_name: Option<String>,
    pub os_version: Option<String>,
    pub build_version: Option<String>,
    pub last_info_requested: Option<DateTime<Utc>>,
    pub last_checked_in: Option<DateTime<Utc>>,
    /// Build the full profile set was last pushed for
    pub last_pushed_build: Option<String>,
    /// Catalog revision the profile set was last pushed at
    pub profiles_revision: u64,
    pub security_info: Option<SecurityInfo>,
    pub os_update_settings: Option<OsUpdateSettings>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Minimal record created on first contact
    pub fn new(id: Uuid, identity: &DeviceIdentity, at: DateTime<Utc>) -> Self {
        Self {
            id,
            udid: identity.udid.clone(),
            serial_number: identity.serial_number.clone(),
            flags: DeviceFlags::default(),
            product_name: None,
            model: None,
            device_name: None,
            os_version: None,
            build_version: None,
            last_info_requested: None,
            last_checked_in: None,
            last_pushed_build: None,
            profiles_revision: 0,
            security_info: None,
            os_update_settings: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            udid: self.udid.clone(),
            serial_number: self.serial_number.clone(),
        }
    }

    /// UDID needed to address the device through the relay
    pub fn command_udid(&self) -> Result<&str, IdentityMissing> {
        self.udid.as_deref().filter(|u| !u.is_empty()).ok_or(IdentityMissing)
    }
}

/// A named set of fields to change on a device.
///
/// Only the fields present are written, so two callers patching disjoint
/// subsets of the same device never overwrite each other.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DevicePatch {
    #[serde(default)]
    pub flags: BTreeMap<Flag, bool>,
    pub product_name: Option<String>,
    pub model: Option<String>,
    pub device_name: Option<String>,
    pub os_version: Option<String>,
    pub build_version: Option<String>,
    pub last_info_requested: Option<DateTime<Utc>>,
    pub last_checked_in: Option<DateTime<Utc>>,
    pub last_pushed_build: Option<String>,
    pub profiles_revision: Option<u64>,
    pub security_info: Option<SecurityInfo>,
    pub os_update_settings: Option<OsUpdateSettings>,
}

impl DevicePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, flag: Flag, value: bool) -> Self {
        self.flags.insert(flag, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write the named fields onto a device
    pub fn apply(&self, device: &mut Device) {
        for (flag, value) in &self.flags {
            device.flags.set(*flag, *value);
        }

        fn assign<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }

        assign(&mut device.product_name, &self.product_name);
        assign(&mut device.model, &self.model);
        assign(&mut device.device_name, &self.device_name);
        assign(&mut device.os_version, &self.os_version);
        assign(&mut device.build_version, &self.build_version);
        assign(&mut device.last_info_requested, &self.last_info_requested);
        assign(&mut device.last_checked_in, &self.last_checked_in);
        assign(&mut device.last_pushed_build, &self.last_pushed_build);
        assign(&mut device.security_info, &self.security_info);
        assign(&mut device.os_update_settings, &self.os_update_settings);
        if let Some(revision) = self.profiles_revision {
            device.profiles_revision = revision;
        }
    }
}
