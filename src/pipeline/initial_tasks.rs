//! Initial task pipeline
//!
//! Position in the pipeline is derived from the device's stored flags, never
//! from a step counter, so a run interrupted by a failure or a restart starts
//! again from the top. Every step is safe to repeat.

use crate::command::CommandGateway;
use crate::config::Policy;
use crate::error::Result;
use crate::store::{CatalogStore, DeviceStore};
use director_shared::{
    now, CommandKind, CommandSpec, Decision, Device, DevicePatch, Flag, PipelineState,
    PipelineStep, DEVICE_INFORMATION_QUERIES,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// What a pipeline invocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The device was not in the entry condition; nothing ran
    NotRequired(PipelineState),
    Completed { profiles: usize, packages: usize },
}

/// Runs setup work for devices through the command gateway
pub struct InitialTasks {
    pub(super) devices: Arc<dyn DeviceStore>,
    pub(super) catalog: Arc<dyn CatalogStore>,
    pub(super) gateway: Arc<CommandGateway>,
    pub(super) policy: Policy,
}

impl InitialTasks {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        catalog: Arc<dyn CatalogStore>,
        gateway: Arc<CommandGateway>,
        policy: Policy,
    ) -> Self {
        Self {
            devices,
            catalog,
            gateway,
            policy,
        }
    }

    /// Run the pipeline if the device is awaiting its initial tasks.
    ///
    /// A failing step aborts the run with the step named in the error and
    /// leaves `initial-tasks-run` unset.
    pub async fn run(&self, device_id: Uuid) -> Result<PipelineOutcome> {
        let device = self.devices.get_by_id(device_id).await?;
        device.command_udid()?;

        let state = PipelineState::from_flags(&device.flags);
        if state.decision() != Decision::RunInitialTasks {
            return Ok(PipelineOutcome::NotRequired(state));
        }

        info!("Running initial tasks for {}", device.identity());

        // Revision is read before installing so later catalog edits still count as drift
        let revision = self.catalog.revision().await?;
        let mut profiles = 0;
        let mut packages = 0;

        for step in PipelineStep::plan(self.policy.reset_profiles_at_enrollment) {
            let result = match step {
                PipelineStep::ResetProfiles => self.reset_profiles(&device).await.map(drop),
                PipelineStep::ClearCommands => self.gateway.clear_pending(&device).await.map(drop),
                PipelineStep::InstallProfiles => self
                    .install_profiles(&device, false)
                    .await
                    .map(|sent| profiles = sent),
                PipelineStep::InstallBootstrapPackages => self
                    .install_bootstrap_packages(&device)
                    .await
                    .map(|sent| packages = sent),
                PipelineStep::MarkConfigured => self.mark_configured(&device, revision).await,
            };

            if let Err(e) = result {
                error!("Initial tasks for {} failed at {}: {}", device.identity(), step, e);
                return Err(e.at_step(step));
            }
        }

        info!(
            "Initial tasks complete for {}: {} profiles, {} packages",
            device.identity(),
            profiles,
            packages
        );
        Ok(PipelineOutcome::Completed { profiles, packages })
    }

    /// Send the device-configured signal and persist the configured flags
    async fn mark_configured(&self, device: &Device, revision: u64) -> Result<()> {
        self.gateway.send_device_configured(device).await?;

        let mut patch = DevicePatch::new()
            .flag(Flag::TokenUpdateReceived, true)
            .flag(Flag::AuthenticateReceived, true)
            .flag(Flag::InitialTasksRun, true);
        patch.last_info_requested = Some(now());
        patch.profiles_revision = Some(revision);
        patch.last_pushed_build = device.build_version.clone();

        self.devices.patch_flags(&device.identity(), &patch).await?;
        Ok(())
    }

    /// Re-announce a device whose initial tasks already ran
    pub async fn announce_configured(&self, device: &Device) -> Result<()> {
        self.gateway.send_device_configured(device).await.map(drop)
    }

    /// Return a device to the pipeline's entry condition without deleting history
    pub async fn reset(&self, device: &Device) -> Result<()> {
        self.gateway.clear_pending(device).await?;
        info!("Resetting {}", device.identity());
        // Nothing installed before the reset is assumed to survive it
        self.catalog.clear_installed(device.id).await?;

        let patch = DevicePatch::new()
            .flag(Flag::TokenUpdateReceived, false)
            .flag(Flag::AuthenticateReceived, false)
            .flag(Flag::InitialTasksRun, false);
        self.devices.patch_flags(&device.identity(), &patch).await?;
        Ok(())
    }

    /// Push profiles again after the catalog or the device's build changed
    pub async fn repush(&self, device: &Device, force: bool) -> Result<usize> {
        let revision = self.catalog.revision().await?;
        let sent = self.install_profiles(device, force).await?;

        let mut patch = DevicePatch::new();
        patch.profiles_revision = Some(revision);
        patch.last_pushed_build = device.build_version.clone();
        self.devices.patch_flags(&device.identity(), &patch).await?;

        info!(
            "Re-pushed {} profiles to {} (revision {}, forced: {})",
            sent,
            device.identity(),
            revision,
            force
        );
        Ok(sent)
    }

    /// Ask the device for information, security state and installed profiles
    pub async fn request_info(&self, device: &Device) -> Result<()> {
        let queries: Vec<&str> = DEVICE_INFORMATION_QUERIES.to_vec();
        self.gateway
            .send(
                device,
                CommandSpec::new(CommandKind::DeviceInformation).field("queries", queries),
            )
            .await?;
        self.gateway
            .send(device, CommandSpec::new(CommandKind::SecurityInfo))
            .await?;
        self.gateway
            .send(device, CommandSpec::new(CommandKind::ProfileList))
            .await?;

        let mut patch = DevicePatch::new();
        patch.last_info_requested = Some(now());
        self.devices.patch_flags(&device.identity(), &patch).await?;
        Ok(())
    }
}
