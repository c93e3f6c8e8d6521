//! In-memory store implementing the full storage contract

use super::{CatalogStore, CommandFilter, CommandStore, DeviceStore};
use crate::error::{DirectorError, Result};
use async_trait::async_trait;
use director_shared::{
    now, CommandRecord, CommandStatus, Device, DeviceIdentity, DevicePatch, InstallApplication,
    Profile, Scope,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Devices, commands and catalog held behind one lock
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<Uuid, Device>,
    by_udid: HashMap<String, Uuid>,
    by_serial: HashMap<String, Uuid>,
    commands: HashMap<String, CommandRecord>,
    intents: HashSet<Uuid>,
    revision: u64,
    profiles: BTreeMap<(Scope, String), Profile>,
    applications: BTreeMap<(Scope, String), InstallApplication>,
    installed: HashMap<Uuid, HashMap<String, String>>,
}

impl Inner {
    /// UDID is authoritative; the serial number is the fallback key
    fn resolve(&self, identity: &DeviceIdentity) -> Option<Uuid> {
        identity
            .udid
            .as_ref()
            .and_then(|u| self.by_udid.get(u).copied())
            .or_else(|| {
                identity
                    .serial_number
                    .as_ref()
                    .and_then(|s| self.by_serial.get(s).copied())
            })
    }

    /// Pick the row an upsert lands on, creating one on first contact
    fn claim(&mut self, identity: &DeviceIdentity) -> Uuid {
        let udid_hit = identity
            .udid
            .as_ref()
            .and_then(|u| self.by_udid.get(u).copied());
        let serial_hit = identity
            .serial_number
            .as_ref()
            .and_then(|s| self.by_serial.get(s).copied());

        match (udid_hit, serial_hit) {
            (Some(udid_row), Some(serial_row)) if udid_row != serial_row => {
                // A row created before the UDID was known is folded into the UDID row
                let serial_only = self
                    .devices
                    .get(&serial_row)
                    .is_some_and(|d| d.udid.is_none());
                if serial_only {
                    self.devices.remove(&serial_row);
                    self.installed.remove(&serial_row);
                    debug!("Merged serial-only device {} into {}", serial_row, udid_row);
                }
                udid_row
            }
            (Some(row), _) | (None, Some(row)) => row,
            (None, None) => {
                let id = Uuid::new_v4();
                self.devices.insert(id, Device::new(id, identity, now()));
                id
            }
        }
    }

    /// Take the latest identity parts onto the row and keep the indexes in step
    fn adopt_identity(&mut self, id: Uuid, identity: &DeviceIdentity) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };

        // A known serial reporting a new UDID was re-provisioned
        if let Some(udid) = &identity.udid {
            if device.udid.as_ref() != Some(udid) {
                if let Some(old) = device.udid.replace(udid.clone()) {
                    debug!("Device {} changed UDID from {} to {}", id, old, udid);
                    if self.by_udid.get(&old) == Some(&id) {
                        self.by_udid.remove(&old);
                    }
                }
            }
        }
        if let Some(serial) = &identity.serial_number {
            if device.serial_number.as_ref() != Some(serial) {
                if let Some(old) = device.serial_number.replace(serial.clone()) {
                    if self.by_serial.get(&old) == Some(&id) {
                        self.by_serial.remove(&old);
                    }
                }
            }
        }

        if let Some(udid) = device.udid.clone() {
            self.by_udid.insert(udid, id);
        }
        if let Some(serial) = device.serial_number.clone() {
            self.by_serial.insert(serial, id);
        }
    }

    fn merged_by_identifier<T: Clone>(
        map: &BTreeMap<(Scope, String), T>,
        device_id: Uuid,
    ) -> Vec<T> {
        let mut merged: BTreeMap<&str, &T> = BTreeMap::new();
        for scope in [Scope::Shared, Scope::Device(device_id)] {
            for ((s, identifier), item) in map.iter() {
                if *s == scope {
                    merged.insert(identifier.as_str(), item);
                }
            }
        }
        merged.into_values().cloned().collect()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get(&self, identity: &DeviceIdentity) -> Result<Device> {
        identity.validate()?;
        let inner = self.inner.read().await;
        inner
            .resolve(identity)
            .and_then(|id| inner.devices.get(&id).cloned())
            .ok_or_else(|| DirectorError::not_found(format!("device {}", identity)))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Device> {
        self.inner
            .read()
            .await
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| DirectorError::not_found(format!("device {}", id)))
    }

    async fn upsert(&self, identity: &DeviceIdentity, patch: &DevicePatch) -> Result<Device> {
        identity.validate()?;
        let mut inner = self.inner.write().await;

        let id = inner.claim(identity);
        inner.adopt_identity(id, identity);

        let device = inner
            .devices
            .get_mut(&id)
            .ok_or_else(|| DirectorError::store(format!("device row {} vanished", id)))?;
        patch.apply(device);
        device.updated_at = now();
        Ok(device.clone())
    }

    async fn patch_flags(&self, identity: &DeviceIdentity, patch: &DevicePatch) -> Result<Device> {
        identity.validate()?;
        let mut inner = self.inner.write().await;

        let id = inner
            .resolve(identity)
            .ok_or_else(|| DirectorError::not_found(format!("device {}", identity)))?;
        let device = inner
            .devices
            .get_mut(&id)
            .ok_or_else(|| DirectorError::not_found(format!("device {}", identity)))?;
        patch.apply(device);
        device.updated_at = now();
        Ok(device.clone())
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(devices)
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn record(&self, command: CommandRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.commands.contains_key(&command.command_uuid) {
            return Err(DirectorError::store(format!(
                "command {} already recorded",
                command.command_uuid
            )));
        }
        inner.commands.insert(command.command_uuid.clone(), command);
        Ok(())
    }

    async fn find(&self, command_uuid: &str) -> Result<Option<CommandRecord>> {
        Ok(self.inner.read().await.commands.get(command_uuid).cloned())
    }

    async fn find_intent(&self, intent: Uuid) -> Result<Option<CommandRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .commands
            .values()
            .find(|c| c.intent == Some(intent))
            .cloned())
    }

    async fn claim_intent(&self, intent: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.commands.values().any(|c| c.intent == Some(intent)) {
            return Ok(false);
        }
        Ok(inner.intents.insert(intent))
    }

    async fn release_intent(&self, intent: Uuid) -> Result<()> {
        self.inner.write().await.intents.remove(&intent);
        Ok(())
    }

    async fn complete(
        &self,
        command_uuid: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<Option<CommandRecord>> {
        let mut inner = self.inner.write().await;
        match inner.commands.get_mut(command_uuid) {
            Some(record) if !record.status.is_final() => {
                record.status = status;
                record.error = error;
                record.updated_at = now();
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn discard_pending(&self, device_id: Uuid) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.commands.len();
        inner
            .commands
            .retain(|_, c| !(c.device_id == device_id && c.status == CommandStatus::Pending));
        Ok(before - inner.commands.len())
    }

    async fn list(&self, filter: CommandFilter) -> Result<Vec<CommandRecord>> {
        let inner = self.inner.read().await;
        let mut commands: Vec<CommandRecord> = inner
            .commands
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        commands.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(commands)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn revision(&self) -> Result<u64> {
        Ok(self.inner.read().await.revision)
    }

    async fn put_profile(&self, scope: Scope, profile: Profile) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let key = (scope, profile.identifier.clone());
        if inner.profiles.get(&key) != Some(&profile) {
            inner.profiles.insert(key, profile);
            inner.revision += 1;
        }
        Ok(inner.revision)
    }

    async fn remove_profile(&self, scope: Scope, identifier: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .profiles
            .remove(&(scope, identifier.to_string()))
            .is_some();
        if removed {
            inner.revision += 1;
        }
        Ok(removed)
    }

    async fn profiles_in(&self, scope: Scope) -> Result<Vec<Profile>> {
        let inner = self.inner.read().await;
        Ok(inner
            .profiles
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn profiles_for(&self, device_id: Uuid) -> Result<Vec<Profile>> {
        let inner = self.inner.read().await;
        Ok(Inner::merged_by_identifier(&inner.profiles, device_id))
    }

    async fn put_application(
        &self,
        scope: Scope,
        application: InstallApplication,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let key = (scope, application.manifest_url.clone());
        if inner.applications.get(&key) != Some(&application) {
            inner.applications.insert(key, application);
            inner.revision += 1;
        }
        Ok(inner.revision)
    }

    async fn applications_in(&self, scope: Scope) -> Result<Vec<InstallApplication>> {
        let inner = self.inner.read().await;
        Ok(inner
            .applications
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn applications_for(&self, device_id: Uuid) -> Result<Vec<InstallApplication>> {
        let inner = self.inner.read().await;
        Ok(Inner::merged_by_identifier(&inner.applications, device_id))
    }

    async fn installed(&self, device_id: Uuid) -> Result<HashMap<String, String>> {
        Ok(self
            .inner
            .read()
            .await
            .installed
            .get(&device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_installed(&self, device_id: Uuid, identifier: &str, hash: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .installed
            .entry(device_id)
            .or_default()
            .insert(identifier.to_string(), hash.to_string());
        Ok(())
    }

    async fn forget_installed(&self, device_id: Uuid, identifiers: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(installed) = inner.installed.get_mut(&device_id) {
            for identifier in identifiers {
                installed.remove(identifier);
            }
        }
        Ok(())
    }

    async fn clear_installed(&self, device_id: Uuid) -> Result<()> {
        self.inner.write().await.installed.remove(&device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_shared::{CommandKind, Flag};
    use serde_json::Map;

    fn pending_command(device_id: Uuid, uuid: &str) -> CommandRecord {
        CommandRecord {
            command_uuid: uuid.into(),
            device_id,
            udid: "ABC".into(),
            kind: CommandKind::DeviceInformation,
            status: CommandStatus::Pending,
            payload: Map::new(),
            subject: None,
            intent: None,
            error: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let store = MemoryStore::new();
        let identity = DeviceIdentity::udid("ABC");

        let created = store
            .upsert(&identity, &DevicePatch::new().flag(Flag::AwaitingConfiguration, true))
            .await
            .unwrap();
        let merged = store
            .upsert(&identity, &DevicePatch::new().flag(Flag::Supervised, true))
            .await
            .unwrap();

        assert_eq!(created.id, merged.id);
        assert!(merged.flags.awaiting_configuration);
        assert!(merged.flags.is_supervised);
        assert_eq!(DeviceStore::list(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_missing_identity() {
        let store = MemoryStore::new();
        let result = store
            .upsert(&DeviceIdentity::default(), &DevicePatch::new())
            .await;
        assert!(matches!(result, Err(DirectorError::IdentityMissing(_))));
    }

    #[tokio::test]
    async fn test_serial_row_gains_udid_instead_of_duplicating() {
        let store = MemoryStore::new();
        let pre = store
            .upsert(&DeviceIdentity::serial("C02XYZ"), &DevicePatch::new())
            .await
            .unwrap();

        let enrolled = store
            .upsert(
                &DeviceIdentity::new(Some("ABC".into()), Some("C02XYZ".into())).unwrap(),
                &DevicePatch::new(),
            )
            .await
            .unwrap();

        assert_eq!(pre.id, enrolled.id);
        assert_eq!(enrolled.udid.as_deref(), Some("ABC"));
        assert_eq!(store.get(&DeviceIdentity::udid("ABC")).await.unwrap().id, pre.id);
        assert_eq!(DeviceStore::list(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_known_serial_with_new_udid_is_reindexed() {
        let store = MemoryStore::new();
        let both = |udid: &str| DeviceIdentity::new(Some(udid.into()), Some("C02XYZ".into()));
        let first = store
            .upsert(&both("OLD").unwrap(), &DevicePatch::new())
            .await
            .unwrap();

        let second = store
            .upsert(&both("NEW").unwrap(), &DevicePatch::new())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.udid.as_deref(), Some("NEW"));
        assert_eq!(store.get(&DeviceIdentity::udid("NEW")).await.unwrap().id, first.id);
        assert!(matches!(
            store.get(&DeviceIdentity::udid("OLD")).await,
            Err(DirectorError::NotFound(_))
        ));
        assert_eq!(DeviceStore::list(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_serial_only_row_folds_into_udid_row() {
        let store = MemoryStore::new();
        let udid_row = store
            .upsert(&DeviceIdentity::udid("ABC"), &DevicePatch::new())
            .await
            .unwrap();
        store
            .upsert(&DeviceIdentity::serial("C02XYZ"), &DevicePatch::new())
            .await
            .unwrap();

        let merged = store
            .upsert(
                &DeviceIdentity::new(Some("ABC".into()), Some("C02XYZ".into())).unwrap(),
                &DevicePatch::new(),
            )
            .await
            .unwrap();

        assert_eq!(merged.id, udid_row.id);
        assert_eq!(merged.serial_number.as_deref(), Some("C02XYZ"));
        assert_eq!(DeviceStore::list(&store).await.unwrap().len(), 1);
        assert_eq!(
            store.get(&DeviceIdentity::serial("C02XYZ")).await.unwrap().id,
            udid_row.id
        );
    }

    #[tokio::test]
    async fn test_disjoint_patches_commute() {
        let a = DevicePatch::new()
            .flag(Flag::AwaitingConfiguration, true)
            .flag(Flag::CloudBackupEnabled, true);
        let mut b = DevicePatch::new().flag(Flag::Supervised, true);
        b.os_version = Some("17.2".into());

        let first = MemoryStore::new();
        let second = MemoryStore::new();
        let identity = DeviceIdentity::udid("ABC");

        first.upsert(&identity, &a).await.unwrap();
        first.upsert(&identity, &b).await.unwrap();
        second.upsert(&identity, &b).await.unwrap();
        second.upsert(&identity, &a).await.unwrap();

        let x = first.get(&identity).await.unwrap();
        let y = second.get(&identity).await.unwrap();
        assert_eq!(x.flags, y.flags);
        assert_eq!(x.os_version, y.os_version);
    }

    #[tokio::test]
    async fn test_patch_flags_on_unknown_device_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .patch_flags(&DeviceIdentity::udid("nope"), &DevicePatch::new())
            .await;
        assert!(matches!(result, Err(DirectorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_complete_is_once_only() {
        let store = MemoryStore::new();
        let device_id = Uuid::new_v4();
        store.record(pending_command(device_id, "c1")).await.unwrap();

        let first = store
            .complete("c1", CommandStatus::Acknowledged, None)
            .await
            .unwrap();
        let again = store
            .complete("c1", CommandStatus::Error, Some("late".into()))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(again.is_none());
        assert_eq!(
            store.find("c1").await.unwrap().unwrap().status,
            CommandStatus::Acknowledged
        );
    }

    #[tokio::test]
    async fn test_intent_is_claimed_once_until_released() {
        let store = MemoryStore::new();
        let intent = Uuid::new_v4();

        assert!(store.claim_intent(intent).await.unwrap());
        assert!(!store.claim_intent(intent).await.unwrap());

        store.release_intent(intent).await.unwrap();
        assert!(store.claim_intent(intent).await.unwrap());

        let recorded = Uuid::new_v4();
        let mut command = pending_command(Uuid::new_v4(), "CMD-1");
        command.intent = Some(recorded);
        store.record(command).await.unwrap();
        assert!(!store.claim_intent(recorded).await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_pending_leaves_other_devices() {
        let store = MemoryStore::new();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        store.record(pending_command(mine, "c1")).await.unwrap();
        store.record(pending_command(mine, "c2")).await.unwrap();
        store.record(pending_command(other, "c3")).await.unwrap();
        store
            .complete("c2", CommandStatus::Acknowledged, None)
            .await
            .unwrap();

        assert_eq!(store.discard_pending(mine).await.unwrap(), 1);
        assert!(store.find("c1").await.unwrap().is_none());
        assert!(store.find("c2").await.unwrap().is_some());
        assert!(store.find("c3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_device_scope_overrides_shared_profile() {
        let store = MemoryStore::new();
        let device_id = Uuid::new_v4();
        store
            .put_profile(Scope::Shared, Profile::new("com.example.wifi", "shared"))
            .await
            .unwrap();
        store
            .put_profile(Scope::Shared, Profile::new("com.example.vpn", "shared"))
            .await
            .unwrap();
        store
            .put_profile(Scope::Device(device_id), Profile::new("com.example.wifi", "mine"))
            .await
            .unwrap();

        let profiles = store.profiles_for(device_id).await.unwrap();
        assert_eq!(profiles.len(), 2);
        let wifi = profiles
            .iter()
            .find(|p| p.identifier == "com.example.wifi")
            .unwrap();
        assert_eq!(wifi.payload, "mine");

        let elsewhere = store.profiles_for(Uuid::new_v4()).await.unwrap();
        assert!(elsewhere.iter().all(|p| p.payload == "shared"));
    }

    #[tokio::test]
    async fn test_revision_only_moves_on_change() {
        let store = MemoryStore::new();
        let r1 = store
            .put_profile(Scope::Shared, Profile::new("com.example.wifi", "v1"))
            .await
            .unwrap();
        let r2 = store
            .put_profile(Scope::Shared, Profile::new("com.example.wifi", "v1"))
            .await
            .unwrap();
        let r3 = store
            .put_profile(Scope::Shared, Profile::new("com.example.wifi", "v2"))
            .await
            .unwrap();

        assert_eq!(r1, r2);
        assert!(r3 > r2);
    }
}
