//! Inbound event handling
//!
//! This module handles:
//! - Decoding relay webhooks (enrollment, check-in, acknowledgement)
//! - Folding reported device state into the device store
//! - Correlating acknowledgements with the commands they answer
//! - Queueing the follow-up work each event calls for
//!
//! Every event is safe to deliver more than once. The queued follow-up work
//! re-checks the device's flags, so a repeat finds its target state already
//! holding and does nothing.

mod webhook;

pub use webhook::{
    device_information_patch, AckStatus, AcknowledgeEvent, CheckinEvent, ErrorChainItem,
    ProfileListItem, SecurityInfoResponse, Webhook, TOPIC_AUTHENTICATE, TOPIC_CHECK_OUT,
    TOPIC_CONNECT, TOPIC_TOKEN_UPDATE,
};

use crate::command::{AckOutcome, CommandGateway};
use crate::error::{DirectorError, Result};
use crate::queue::{CheckinQueue, WorkItem};
use crate::store::{CatalogStore, DeviceStore};
use director_shared::{
    now, CommandKind, CommandRecord, CommandStatus, Device, DeviceIdentity, DevicePatch, Flag,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies inbound events to the store and queues the resulting work
pub struct EventHandler {
    devices: Arc<dyn DeviceStore>,
    catalog: Arc<dyn CatalogStore>,
    gateway: Arc<CommandGateway>,
    queue: CheckinQueue,
}

impl EventHandler {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        catalog: Arc<dyn CatalogStore>,
        gateway: Arc<CommandGateway>,
        queue: CheckinQueue,
    ) -> Self {
        Self {
            devices,
            catalog,
            gateway,
            queue,
        }
    }

    /// Decode and apply a raw webhook body, answering with an HTTP status
    pub async fn ingest_json(&self, body: &[u8]) -> u16 {
        match serde_json::from_slice::<Webhook>(body) {
            Ok(webhook) => self.ingest(&webhook).await,
            Err(e) => {
                warn!("Rejected malformed webhook: {}", e);
                400
            }
        }
    }

    /// Apply one webhook, answering with an HTTP status.
    ///
    /// Failures are logged with full context; the status carries none of it.
    pub async fn ingest(&self, webhook: &Webhook) -> u16 {
        debug!("<<< Webhook {} ({})", webhook.topic, webhook.event_id);

        let result = match webhook.topic.as_str() {
            TOPIC_AUTHENTICATE | TOPIC_TOKEN_UPDATE | TOPIC_CHECK_OUT => {
                let Some(checkin) = &webhook.checkin_event else {
                    warn!("{} event {} has no checkin body", webhook.topic, webhook.event_id);
                    return 400;
                };
                match webhook.topic.as_str() {
                    TOPIC_AUTHENTICATE => self.authenticate(checkin).await.map(drop),
                    TOPIC_TOKEN_UPDATE => self.token_update(checkin).await.map(drop),
                    _ => self.check_out(checkin).await,
                }
            }
            TOPIC_CONNECT => {
                let Some(ack) = &webhook.acknowledge_event else {
                    warn!("{} event {} has no acknowledge body", webhook.topic, webhook.event_id);
                    return 400;
                };
                self.acknowledge(ack).await
            }
            other => {
                debug!("Ignoring webhook topic {}", other);
                Ok(())
            }
        };

        match result {
            Ok(()) => 200,
            Err(e) => {
                error!(
                    "Failed to process {} event {}: {}",
                    webhook.topic, webhook.event_id, e
                );
                e.status_code()
            }
        }
    }

    /// A device (re-)enrolled: record it and reconfigure it from scratch
    pub async fn authenticate(&self, event: &CheckinEvent) -> Result<Device> {
        let identity = event.identity()?;
        let mut patch = event.attributes();
        patch.last_checked_in = Some(now());

        let device = self.devices.upsert(&identity, &patch).await?;
        info!("Authenticate from {}", device.identity());

        self.queue.enqueue(device.id, WorkItem::Reset).await?;
        Ok(device)
    }

    /// Enrollment completed: record the reported flags and re-check the pipeline
    pub async fn token_update(&self, event: &CheckinEvent) -> Result<Device> {
        let identity = event.identity()?;
        let mut patch = event
            .attributes()
            .flag(Flag::AwaitingConfiguration, event.awaiting_configuration)
            .flag(Flag::TokenUpdateReceived, true);
        patch.last_checked_in = Some(now());

        let device = self.devices.upsert(&identity, &patch).await?;
        info!(
            "TokenUpdate from {} (awaiting configuration: {})",
            device.identity(),
            event.awaiting_configuration
        );

        self.queue.enqueue(device.id, WorkItem::Evaluate).await?;
        Ok(device)
    }

    /// The device left management
    pub async fn check_out(&self, event: &CheckinEvent) -> Result<()> {
        let identity = event.identity()?;
        let device = match self.devices.get(&identity).await {
            Ok(device) => device,
            Err(DirectorError::NotFound(_)) => {
                debug!("CheckOut from unknown device {}", identity);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!("CheckOut from {}", device.identity());
        self.queue.enqueue(device.id, WorkItem::Reset).await
    }

    /// A command result or an idle check-in
    pub async fn acknowledge(&self, event: &AcknowledgeEvent) -> Result<()> {
        let identity = DeviceIdentity::udid(event.udid.as_str());
        identity.validate()?;

        let Some(status) = event.status.command_status() else {
            return self.touch(&identity).await;
        };

        let record = match self
            .gateway
            .handle_ack(&event.command_uuid, status, event.error_message())
            .await?
        {
            AckOutcome::Completed(record) => record,
            AckOutcome::Duplicate(_) | AckOutcome::Unknown | AckOutcome::Deferred => {
                return self.touch(&identity).await;
            }
        };

        let device = self.devices.get_by_id(record.device_id).await?;
        let mut patch = DevicePatch::new();
        let mut evaluate = false;

        if record.status == CommandStatus::Acknowledged {
            match record.kind {
                CommandKind::DeviceInformation => {
                    if let Some(responses) = &event.query_responses {
                        patch = device_information_patch(responses);
                        evaluate = true;
                    }
                }
                CommandKind::SecurityInfo => {
                    patch.security_info = event.security_info.clone().map(Into::into);
                }
                CommandKind::ProfileList => {
                    if let Some(list) = &event.profile_list {
                        self.prune_installed(&device, list).await?;
                    }
                }
                CommandKind::InstallProfile | CommandKind::InstallEnterpriseApplication => {
                    self.mark_installed(&device, &record).await?;
                }
                _ => {}
            }
        }

        patch.last_checked_in = Some(now());
        self.devices.patch_flags(&device.identity(), &patch).await?;

        // Only a fresh DeviceInformation answer can change the pipeline decision
        if evaluate {
            self.queue.enqueue(device.id, WorkItem::Evaluate).await?;
        }
        Ok(())
    }

    async fn mark_installed(&self, device: &Device, record: &CommandRecord) -> Result<()> {
        let Some(subject) = &record.subject else {
            return Ok(());
        };
        self.catalog
            .mark_installed(device.id, &subject.identifier, &subject.hash)
            .await?;
        debug!("{} installed {}", device.identity(), subject.identifier);
        Ok(())
    }

    /// Forget profiles the device no longer reports
    async fn prune_installed(&self, device: &Device, list: &[ProfileListItem]) -> Result<()> {
        let reported: HashSet<&str> = list.iter().map(|p| p.payload_identifier.as_str()).collect();
        let applications: HashSet<String> = self
            .catalog
            .applications_for(device.id)
            .await?
            .into_iter()
            .map(|a| a.manifest_url)
            .collect();

        let gone: Vec<String> = self
            .catalog
            .installed(device.id)
            .await?
            .into_keys()
            .filter(|id| !reported.contains(id.as_str()) && !applications.contains(id))
            .collect();

        if !gone.is_empty() {
            info!("{} no longer reports {} profiles", device.identity(), gone.len());
            self.catalog.forget_installed(device.id, &gone).await?;
        }
        Ok(())
    }

    /// Stamp the check-in time of a known device
    async fn touch(&self, identity: &DeviceIdentity) -> Result<()> {
        let mut patch = DevicePatch::new();
        patch.last_checked_in = Some(now());
        match self.devices.patch_flags(identity, &patch).await {
            Ok(_) | Err(DirectorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueReceiver;
    use crate::relay::SimulatedRelay;
    use crate::store::MemoryStore;
    use director_shared::{CommandSpec, Profile, Scope};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        handler: EventHandler,
        store: Arc<MemoryStore>,
        gateway: Arc<CommandGateway>,
        queue: CheckinQueue,
        _receiver: QueueReceiver,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let relay = Arc::new(SimulatedRelay::new());
        let gateway = Arc::new(CommandGateway::new(relay, store.clone(), Duration::from_secs(1)));
        let (queue, receiver) = CheckinQueue::new(16);
        let handler = EventHandler::new(store.clone(), store.clone(), gateway.clone(), queue.clone());
        Fixture {
            handler,
            store,
            gateway,
            queue,
            _receiver: receiver,
        }
    }

    fn ack(udid: &str, command_uuid: &str, status: AckStatus) -> AcknowledgeEvent {
        AcknowledgeEvent {
            udid: udid.into(),
            status,
            command_uuid: command_uuid.into(),
            error_chain: Vec::new(),
            query_responses: None,
            security_info: None,
            profile_list: None,
        }
    }

    #[tokio::test]
    async fn test_token_update_creates_device_and_queues_evaluate() {
        let f = fixture();
        let body = json!({
            "topic": "mdm.TokenUpdate",
            "event_id": "e1",
            "checkin_event": {"udid": "ABC", "awaiting_configuration": true}
        });

        let status = f.handler.ingest_json(body.to_string().as_bytes()).await;

        assert_eq!(status, 200);
        let device = f.store.get(&DeviceIdentity::udid("ABC")).await.unwrap();
        assert!(device.flags.awaiting_configuration);
        assert!(device.flags.token_update_received);
        assert!(!device.flags.initial_tasks_run);
        assert_eq!(f.queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_missing_identity_is_rejected() {
        let f = fixture();
        let webhook = Webhook {
            topic: TOPIC_TOKEN_UPDATE.into(),
            event_id: "e1".into(),
            created_at: None,
            checkin_event: Some(CheckinEvent::default()),
            acknowledge_event: None,
        };

        assert_eq!(f.handler.ingest(&webhook).await, 400);
        assert_eq!(f.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let f = fixture();
        assert_eq!(f.handler.ingest_json(b"{not json").await, 400);
    }

    #[tokio::test]
    async fn test_install_ack_marks_subject_installed() {
        let f = fixture();
        let device = f
            .store
            .upsert(&DeviceIdentity::udid("ABC"), &DevicePatch::new())
            .await
            .unwrap();
        let profile = Profile::new("com.example.wifi", "wifi");
        let handle = f
            .gateway
            .send(
                &device,
                CommandSpec::new(CommandKind::InstallProfile).subject(profile.subject()),
            )
            .await
            .unwrap();

        f.handler
            .acknowledge(&ack("ABC", &handle.command_uuid, AckStatus::Acknowledged))
            .await
            .unwrap();

        let installed = f.store.installed(device.id).await.unwrap();
        assert_eq!(installed.get("com.example.wifi"), Some(&profile.hash));
        assert!(f.gateway.pending_for(&device).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_device_information_is_folded_and_evaluated() {
        let f = fixture();
        let device = f
            .store
            .upsert(&DeviceIdentity::udid("ABC"), &DevicePatch::new())
            .await
            .unwrap();
        let handle = f
            .gateway
            .send(&device, CommandSpec::new(CommandKind::DeviceInformation))
            .await
            .unwrap();
        let mut event = ack("ABC", &handle.command_uuid, AckStatus::Acknowledged);
        event.query_responses = json!({"AwaitingConfiguration": true, "OSVersion": "17.4"})
            .as_object()
            .cloned();

        f.handler.acknowledge(&event).await.unwrap();

        let device = f.store.get_by_id(device.id).await.unwrap();
        assert!(device.flags.awaiting_configuration);
        assert_eq!(device.os_version.as_deref(), Some("17.4"));
        assert!(device.last_checked_in.is_some());
        assert_eq!(f.queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_profile_list_prunes_missing_profiles() {
        let f = fixture();
        let device = f
            .store
            .upsert(&DeviceIdentity::udid("ABC"), &DevicePatch::new())
            .await
            .unwrap();
        f.store.mark_installed(device.id, "com.example.kept", "h1").await.unwrap();
        f.store.mark_installed(device.id, "com.example.gone", "h2").await.unwrap();
        f.store
            .put_profile(Scope::Shared, Profile::new("com.example.kept", "x"))
            .await
            .unwrap();
        let handle = f
            .gateway
            .send(&device, CommandSpec::new(CommandKind::ProfileList))
            .await
            .unwrap();
        let mut event = ack("ABC", &handle.command_uuid, AckStatus::Acknowledged);
        event.profile_list = Some(vec![ProfileListItem {
            payload_identifier: "com.example.kept".into(),
        }]);

        f.handler.acknowledge(&event).await.unwrap();

        let installed = f.store.installed(device.id).await.unwrap();
        assert!(installed.contains_key("com.example.kept"));
        assert!(!installed.contains_key("com.example.gone"));
        assert_eq!(f.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_acks_are_absorbed() {
        let f = fixture();
        let device = f
            .store
            .upsert(&DeviceIdentity::udid("ABC"), &DevicePatch::new())
            .await
            .unwrap();
        let handle = f
            .gateway
            .send(&device, CommandSpec::new(CommandKind::SecurityInfo))
            .await
            .unwrap();
        let event = ack("ABC", &handle.command_uuid, AckStatus::Acknowledged);
        let webhook = Webhook {
            topic: TOPIC_CONNECT.into(),
            event_id: "e1".into(),
            created_at: None,
            checkin_event: None,
            acknowledge_event: Some(event),
        };

        assert_eq!(f.handler.ingest(&webhook).await, 200);
        assert_eq!(f.handler.ingest(&webhook).await, 200);
        assert_eq!(
            f.handler
                .ingest(&Webhook {
                    acknowledge_event: Some(ack("ABC", "never-sent", AckStatus::Acknowledged)),
                    ..webhook.clone()
                })
                .await,
            200
        );
    }

    #[tokio::test]
    async fn test_authenticate_queues_reset() {
        let f = fixture();
        let event = CheckinEvent {
            udid: Some("ABC".into()),
            serial_number: Some("C02X".into()),
            ..CheckinEvent::default()
        };

        let device = f.handler.authenticate(&event).await.unwrap();

        assert_eq!(device.serial_number.as_deref(), Some("C02X"));
        assert_eq!(f.queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_check_out_leaves_state_to_the_queued_reset() {
        let f = fixture();
        let device = f
            .store
            .upsert(&DeviceIdentity::udid("ABC"), &DevicePatch::new())
            .await
            .unwrap();
        f.store
            .mark_installed(device.id, "com.example.wifi", "h1")
            .await
            .unwrap();
        let event = CheckinEvent {
            udid: Some("ABC".into()),
            ..CheckinEvent::default()
        };

        f.handler.check_out(&event).await.unwrap();

        assert_eq!(f.queue.depth().await, 1);
        assert_eq!(f.store.installed(device.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_out_of_unknown_device_is_ignored() {
        let f = fixture();
        let event = CheckinEvent {
            udid: Some("NOPE".into()),
            ..CheckinEvent::default()
        };

        f.handler.check_out(&event).await.unwrap();
        assert_eq!(f.queue.depth().await, 0);
    }
}
