//! Director context
//!
//! This module handles:
//! - Wiring stores, relay, gateway, pipeline and queue from one config value
//! - Processing queued per-device work
//! - The query and mutation functions behind the administrator API

use crate::command::CommandGateway;
use crate::config::DirectorConfig;
use crate::error::{DirectorError, Result};
use crate::events::{EventHandler, Webhook};
use crate::pipeline::InitialTasks;
use crate::queue::{CheckinQueue, PendingWork, QueueReceiver, WorkHandler, WorkItem};
use crate::reconcile::Reconciler;
use crate::relay::RelayClient;
use crate::store::{CatalogStore, CommandFilter, CommandStore, DeviceStore};
use async_trait::async_trait;
use director_shared::{
    CommandKind, CommandRecord, CommandSpec, Decision, Device, DeviceIdentity,
    InstallApplication, PipelineState, Profile, Scope,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Shared context every entry point goes through
pub struct Director {
    config: Arc<DirectorConfig>,
    devices: Arc<dyn DeviceStore>,
    commands: Arc<dyn CommandStore>,
    catalog: Arc<dyn CatalogStore>,
    relay: Arc<dyn RelayClient>,
    gateway: Arc<CommandGateway>,
    tasks: InitialTasks,
    events: EventHandler,
    queue: CheckinQueue,
}

impl Director {
    /// Build the context over one store implementing every storage trait
    pub fn new<S>(
        config: Arc<DirectorConfig>,
        relay: Arc<dyn RelayClient>,
        store: Arc<S>,
    ) -> (Self, QueueReceiver)
    where
        S: DeviceStore + CommandStore + CatalogStore + 'static,
    {
        let devices: Arc<dyn DeviceStore> = store.clone();
        let commands: Arc<dyn CommandStore> = store.clone();
        let catalog: Arc<dyn CatalogStore> = store;

        let gateway = Arc::new(CommandGateway::new(
            relay.clone(),
            commands.clone(),
            config.relay.timeout,
        ));
        let (queue, receiver) = CheckinQueue::new(config.queue.capacity);
        let tasks = InitialTasks::new(
            devices.clone(),
            catalog.clone(),
            gateway.clone(),
            config.policy,
        );
        let events = EventHandler::new(
            devices.clone(),
            catalog.clone(),
            gateway.clone(),
            queue.clone(),
        );

        let director = Self {
            config,
            devices,
            commands,
            catalog,
            relay,
            gateway,
            tasks,
            events,
            queue,
        };
        (director, receiver)
    }

    /// Start the configured number of checkin workers
    pub fn spawn_workers(self: &Arc<Self>, receiver: QueueReceiver) -> Vec<JoinHandle<()>> {
        info!("Starting {} checkin workers", self.config.queue.workers);
        receiver.spawn_workers(self.clone(), self.config.queue.workers)
    }

    /// Reconciliation loop over the same stores and queue
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.devices.clone(),
            self.catalog.clone(),
            self.relay.clone(),
            self.queue.clone(),
            self.config.policy,
            self.config.reconcile.clone(),
            self.config.relay.timeout,
        )
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    pub fn queue(&self) -> &CheckinQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    pub fn relay_name(&self) -> &'static str {
        self.gateway.relay_name()
    }

    pub async fn ingest(&self, webhook: &Webhook) -> u16 {
        self.events.ingest(webhook).await
    }

    pub async fn ingest_json(&self, body: &[u8]) -> u16 {
        self.events.ingest_json(body).await
    }

    /// Act on the pipeline decision for the device's current flags
    async fn evaluate(&self, device: &Device) -> Result<()> {
        let state = PipelineState::from_flags(&device.flags);
        match state.decision() {
            Decision::RunInitialTasks => self.tasks.run(device.id).await.map(drop),
            Decision::AnnounceConfigured => self.tasks.announce_configured(device).await,
            Decision::None => {
                debug!("{} needs nothing in state {:?}", device.identity(), state);
                Ok(())
            }
        }
    }

    async fn device(&self, udid: &str) -> Result<Device> {
        self.devices.get(&DeviceIdentity::udid(udid)).await
    }

    // Administrator API

    pub async fn get_device(&self, udid: &str) -> Result<Device> {
        self.device(udid).await
    }

    pub async fn get_device_by_serial(&self, serial_number: &str) -> Result<Device> {
        self.devices.get(&DeviceIdentity::serial(serial_number)).await
    }

    pub async fn get_all_devices(&self) -> Result<Vec<Device>> {
        self.devices.list().await
    }

    pub async fn pending_commands(&self) -> Result<Vec<CommandRecord>> {
        self.commands.list(CommandFilter::pending()).await
    }

    pub async fn error_commands(&self) -> Result<Vec<CommandRecord>> {
        self.commands.list(CommandFilter::errors()).await
    }

    pub async fn all_commands(&self) -> Result<Vec<CommandRecord>> {
        self.commands.list(CommandFilter::all()).await
    }

    /// Queue a clear of the device's pending commands behind any work in flight
    pub async fn delete_pending_commands(&self, udid: &str) -> Result<()> {
        let device = self.device(udid).await?;
        self.queue.enqueue(device.id, WorkItem::ClearPending).await
    }

    /// Scope addressing one device's own assignments
    pub async fn device_scope(&self, udid: &str) -> Result<Scope> {
        Ok(Scope::Device(self.device(udid).await?.id))
    }

    pub async fn assign_profile(&self, scope: Scope, profile: Profile) -> Result<u64> {
        info!("Assigning profile {} to {:?}", profile.identifier, scope);
        self.catalog.put_profile(scope, profile).await
    }

    pub async fn remove_profile(&self, scope: Scope, identifier: &str) -> Result<()> {
        if !self.catalog.remove_profile(scope, identifier).await? {
            return Err(DirectorError::not_found(format!("profile {}", identifier)));
        }
        info!("Removed profile {} from {:?}", identifier, scope);
        Ok(())
    }

    pub async fn shared_profiles(&self) -> Result<Vec<Profile>> {
        self.catalog.profiles_in(Scope::Shared).await
    }

    /// Profiles assigned directly to one device
    pub async fn device_profiles(&self, udid: &str) -> Result<Vec<Profile>> {
        let scope = self.device_scope(udid).await?;
        self.catalog.profiles_in(scope).await
    }

    pub async fn assign_application(
        &self,
        scope: Scope,
        application: InstallApplication,
    ) -> Result<u64> {
        info!("Assigning application {} to {:?}", application.manifest_url, scope);
        self.catalog.put_application(scope, application).await
    }

    pub async fn shared_applications(&self) -> Result<Vec<InstallApplication>> {
        self.catalog.applications_in(Scope::Shared).await
    }

    /// Queue a reset; the device re-enters the pipeline on its next qualifying event
    pub async fn request_reset(&self, udid: &str) -> Result<()> {
        let device = self.device(udid).await?;
        self.queue.enqueue(device.id, WorkItem::Reset).await
    }

    /// Queue a wipe. Repeating the call with the same intent does not wipe it again;
    /// [`Director::erase_status`] reports the command once it went out.
    pub async fn erase_device(&self, udid: &str, intent: Uuid) -> Result<()> {
        let device = self.device(udid).await?;
        info!("Erase requested for {} (intent {})", device.identity(), intent);
        self.queue.enqueue(device.id, WorkItem::Erase { intent }).await
    }

    pub async fn erase_status(&self, intent: Uuid) -> Result<Option<CommandRecord>> {
        self.commands.find_intent(intent).await
    }
}

#[async_trait]
impl WorkHandler for Director {
    async fn process(&self, device_id: Uuid, work: PendingWork) -> Result<()> {
        let mut first_error = None;

        for item in work.items() {
            // Reloaded per item; earlier items change the flags
            let device = self.devices.get_by_id(device_id).await?;
            if device.udid.is_none() {
                debug!("Skipping {} for {}: no UDID yet", item, device.identity());
                return Ok(());
            }

            let result = match item {
                WorkItem::Reset => self.tasks.reset(&device).await,
                WorkItem::Evaluate => self.evaluate(&device).await,
                WorkItem::Repush { force } => self.tasks.repush(&device, force).await.map(drop),
                WorkItem::RequestInfo => self.tasks.request_info(&device).await,
                WorkItem::ClearPending => self.gateway.clear_pending(&device).await.map(drop),
                WorkItem::Erase { intent } => self
                    .gateway
                    .send(&device, CommandSpec::new(CommandKind::EraseDevice).intent(intent))
                    .await
                    .map(drop),
            };

            if let Err(e) = result {
                error!("{} failed for {}: {}", item, device.identity(), e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
