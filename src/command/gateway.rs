//! Command gateway for sending commands to devices through the relay

use crate::error::{DirectorError, Result};
use crate::relay::RelayClient;
use crate::store::{CommandFilter, CommandStore};
use director_shared::{
    limits, now, CommandHandle, CommandKind, CommandRecord, CommandRequest, CommandSpec,
    CommandStatus, Device,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of correlating an acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// A pending command moved to its final status
    Completed(CommandRecord),
    /// The command was already final; the duplicate was absorbed
    Duplicate(CommandRecord),
    /// Not a command we are tracking (never sent, or discarded by a clear)
    Unknown,
    /// The device deferred the command; it stays pending
    Deferred,
}

/// Dispatches commands to the relay and tracks them until acknowledged
pub struct CommandGateway {
    relay: Arc<dyn RelayClient>,
    commands: Arc<dyn CommandStore>,
    relay_timeout: Duration,
}

impl CommandGateway {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        commands: Arc<dyn CommandStore>,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            commands,
            relay_timeout,
        }
    }

    /// Send one command without waiting for it to run. Records it as pending.
    pub async fn send(&self, device: &Device, spec: CommandSpec) -> Result<CommandHandle> {
        let udid = device.command_udid()?.to_string();

        if spec.kind.is_destructive() {
            let Some(intent) = spec.intent else {
                return Err(DirectorError::IntentRequired { kind: spec.kind });
            };
            if let Some(existing) = self.issued(intent, &udid, spec.kind).await? {
                return Ok(existing);
            }
            // The claim and the check happen under one store write
            if !self.commands.claim_intent(intent).await? {
                if let Some(existing) = self.issued(intent, &udid, spec.kind).await? {
                    return Ok(existing);
                }
                return Err(DirectorError::IntentInFlight {
                    kind: spec.kind,
                    intent,
                });
            }
        }

        let request = CommandRequest::new(&udid, &spec);
        let dispatched = match timeout(self.relay_timeout, self.relay.enqueue(&request)).await {
            Ok(Ok(uuid)) => Ok(uuid),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "relay did not answer within {:?}",
                self.relay_timeout
            )),
        };
        let command_uuid = match dispatched {
            Ok(uuid) => uuid,
            Err(message) => {
                if let Some(intent) = spec.intent.filter(|_| spec.kind.is_destructive()) {
                    self.commands.release_intent(intent).await?;
                }
                return Err(DirectorError::DispatchFailed {
                    udid,
                    kind: spec.kind,
                    message,
                });
            }
        };

        let at = now();
        let record = CommandRecord {
            command_uuid: command_uuid.clone(),
            device_id: device.id,
            udid: udid.clone(),
            kind: spec.kind,
            status: CommandStatus::Pending,
            payload: spec.payload,
            subject: spec.subject,
            intent: spec.intent,
            error: None,
            created_at: at,
            updated_at: at,
        };
        self.commands.record(record).await?;

        debug!(">>> Sent {} to {} ({})", spec.kind, udid, command_uuid);

        Ok(CommandHandle {
            command_uuid,
            kind: spec.kind,
        })
    }

    /// Handle of a command already recorded for this intent
    async fn issued(
        &self,
        intent: Uuid,
        udid: &str,
        kind: CommandKind,
    ) -> Result<Option<CommandHandle>> {
        let Some(existing) = self.commands.find_intent(intent).await? else {
            return Ok(None);
        };
        warn!(
            "{} for {} already issued as {} (intent {}), not sending again",
            kind, udid, existing.command_uuid, intent
        );
        Ok(Some(existing.handle()))
    }

    /// Send the device-configured signal.
    ///
    /// It goes out twice in a row so a single message lost on the relay side
    /// does not leave the device waiting in Setup Assistant.
    pub async fn send_device_configured(&self, device: &Device) -> Result<Vec<CommandHandle>> {
        let mut handles = Vec::with_capacity(limits::DEVICE_CONFIGURED_SENDS);
        for _ in 0..limits::DEVICE_CONFIGURED_SENDS {
            let handle = self
                .send(device, CommandSpec::new(CommandKind::DeviceConfigured))
                .await?;
            handles.push(handle);
        }
        info!("Sent DeviceConfigured to {}", device.identity());
        Ok(handles)
    }

    /// Discard every pending command for a device so late acknowledgements
    /// from an earlier attempt cannot be attributed to a new one
    pub async fn clear_pending(&self, device: &Device) -> Result<usize> {
        let cleared = self.commands.discard_pending(device.id).await?;
        if cleared > 0 {
            info!("Cleared {} pending commands for {}", cleared, device.identity());
        }
        Ok(cleared)
    }

    /// Correlate an acknowledgement with the command it answers
    pub async fn handle_ack(
        &self,
        command_uuid: &str,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<AckOutcome> {
        if status == CommandStatus::Pending {
            debug!("<<< {} deferred by device", command_uuid);
            return Ok(AckOutcome::Deferred);
        }

        if let Some(record) = self.commands.complete(command_uuid, status, error).await? {
            debug!(
                "<<< {} for {} from {}: {:?}",
                record.kind, record.command_uuid, record.udid, record.status
            );
            if record.status == CommandStatus::Error {
                warn!(
                    "{} failed on {}: {}",
                    record.kind,
                    record.udid,
                    record.error.as_deref().unwrap_or("no detail")
                );
            }
            return Ok(AckOutcome::Completed(record));
        }

        match self.commands.find(command_uuid).await? {
            Some(record) => {
                debug!("<<< Duplicate acknowledgement for {}", command_uuid);
                Ok(AckOutcome::Duplicate(record))
            }
            None => {
                debug!("<<< Acknowledgement for unknown command {}", command_uuid);
                Ok(AckOutcome::Unknown)
            }
        }
    }

    /// Pending commands for one device
    pub async fn pending_for(&self, device: &Device) -> Result<Vec<CommandRecord>> {
        self.commands
            .list(CommandFilter::pending().for_device(device.id))
            .await
    }

    pub async fn list(&self, filter: CommandFilter) -> Result<Vec<CommandRecord>> {
        self.commands.list(filter).await
    }

    pub fn relay_name(&self) -> &'static str {
        self.relay.name()
    }
}
