//! Profile and package installation steps

use super::InitialTasks;
use crate::error::Result;
use director_shared::{CommandKind, CommandSpec, Device, Subject};
use std::collections::HashSet;
use tracing::debug;

impl InitialTasks {
    /// Subjects already on the device or on their way there
    async fn delivered(&self, device: &Device) -> Result<HashSet<Subject>> {
        let mut delivered: HashSet<Subject> = self
            .catalog
            .installed(device.id)
            .await?
            .into_iter()
            .map(|(identifier, hash)| Subject { identifier, hash })
            .collect();

        for command in self.gateway.pending_for(device).await? {
            if let Some(subject) = command.subject {
                delivered.insert(subject);
            }
        }
        Ok(delivered)
    }

    /// Remove every profile previously put on the device
    pub(super) async fn reset_profiles(&self, device: &Device) -> Result<usize> {
        let applications: HashSet<String> = self
            .catalog
            .applications_for(device.id)
            .await?
            .into_iter()
            .map(|a| a.manifest_url)
            .collect();

        let mut identifiers: Vec<String> = self
            .catalog
            .installed(device.id)
            .await?
            .into_keys()
            .filter(|identifier| !applications.contains(identifier))
            .collect();
        for profile in self.catalog.profiles_for(device.id).await? {
            if !identifiers.contains(&profile.identifier) {
                identifiers.push(profile.identifier);
            }
        }
        identifiers.sort();

        for identifier in &identifiers {
            self.gateway
                .send(
                    device,
                    CommandSpec::new(CommandKind::RemoveProfile).field("identifier", identifier.as_str()),
                )
                .await?;
        }
        self.catalog.forget_installed(device.id, &identifiers).await?;

        debug!("Removed {} profiles from {}", identifiers.len(), device.identity());
        Ok(identifiers.len())
    }

    /// Push every profile assigned to the device, directly or through shared scope.
    ///
    /// Profiles already installed with the same content, or with an install
    /// still pending, are skipped unless `force` is set.
    pub(super) async fn install_profiles(&self, device: &Device, force: bool) -> Result<usize> {
        let delivered = if force {
            HashSet::new()
        } else {
            self.delivered(device).await?
        };

        let mut sent = 0;
        for profile in self.catalog.profiles_for(device.id).await? {
            let subject = profile.subject();
            if delivered.contains(&subject) {
                continue;
            }
            let mut spec = CommandSpec::new(CommandKind::InstallProfile)
                .field("payload", profile.payload)
                .subject(subject);
            // Signing happens relay-side
            if self.policy.sign_profiles {
                spec = spec.field("sign", true);
            }
            self.gateway.send(device, spec).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Push every application marked for install at enrollment
    pub(super) async fn install_bootstrap_packages(&self, device: &Device) -> Result<usize> {
        let delivered = self.delivered(device).await?;

        let mut sent = 0;
        for application in self.catalog.applications_for(device.id).await? {
            if !application.bootstrap {
                continue;
            }
            let subject = application.subject();
            if delivered.contains(&subject) {
                continue;
            }
            self.gateway
                .send(
                    device,
                    CommandSpec::new(CommandKind::InstallEnterpriseApplication)
                        .field("manifest_url", application.manifest_url)
                        .subject(subject),
                )
                .await?;
            sent += 1;
        }
        Ok(sent)
    }
}
