//! Scheduled reconciliation
//!
//! Periodically pulls the roster, compares each device's recorded state with
//! what the catalog and policy want, and queues targeted work for the gap.

use crate::config::{Policy, ReconcileConfig};
use crate::error::Result;
use crate::queue::{CheckinQueue, WorkItem};
use crate::relay::RelayClient;
use crate::store::{CatalogStore, DeviceStore};
use chrono::{DateTime, Utc};
use director_shared::{now, Device, DeviceIdentity, DevicePatch, PipelineState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub enqueued: usize,
    pub failed: usize,
}

/// Work a device needs, given its record and the current catalog revision
pub fn plan(
    device: &Device,
    revision: u64,
    policy: &Policy,
    info_request_interval: Duration,
    at: DateTime<Utc>,
) -> Vec<WorkItem> {
    if device.udid.is_none() {
        return Vec::new();
    }

    let mut work = Vec::new();
    match PipelineState::from_flags(&device.flags) {
        PipelineState::AwaitingInitialTasks | PipelineState::AwaitingRelease => {
            work.push(WorkItem::Evaluate);
        }
        PipelineState::Configured => {
            let build_changed = device.build_version.is_some()
                && device.build_version != device.last_pushed_build;
            if policy.push_on_new_build && build_changed {
                work.push(WorkItem::Repush { force: true });
            } else if revision > device.profiles_revision {
                work.push(WorkItem::Repush { force: false });
            }
        }
        PipelineState::Idle => {}
    }

    let stale = match device.last_info_requested {
        None => true,
        Some(last) => (at - last)
            .to_std()
            .map_or(false, |age| age >= info_request_interval),
    };
    if stale {
        work.push(WorkItem::RequestInfo);
    }

    work
}

/// Runs sweeps on a fixed interval
pub struct Reconciler {
    devices: Arc<dyn DeviceStore>,
    catalog: Arc<dyn CatalogStore>,
    relay: Arc<dyn RelayClient>,
    queue: CheckinQueue,
    policy: Policy,
    config: ReconcileConfig,
    relay_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        catalog: Arc<dyn CatalogStore>,
        relay: Arc<dyn RelayClient>,
        queue: CheckinQueue,
        policy: Policy,
        config: ReconcileConfig,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            devices,
            catalog,
            relay,
            queue,
            policy,
            config,
            relay_timeout,
        }
    }

    /// Sweep forever, one pass per interval
    pub async fn run(&self) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.sweep().await {
                Ok(report) => info!(
                    "Reconciliation sweep: {} examined, {} enqueued, {} failed",
                    report.examined, report.enqueued, report.failed
                ),
                Err(e) => warn!("Reconciliation sweep aborted: {}", e),
            }
        }
    }

    /// One pass over the roster. A device that fails is counted and skipped.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sync_roster().await;

        let revision = self.catalog.revision().await?;
        let at = now();
        let mut report = SweepReport::default();

        for device in self.devices.list().await? {
            report.examined += 1;

            let work = plan(
                &device,
                revision,
                &self.policy,
                self.config.info_request_interval,
                at,
            );
            if work.is_empty() {
                continue;
            }

            let mut failed = false;
            for item in work {
                if let Err(e) = self.queue.enqueue(device.id, item).await {
                    warn!("Could not queue {} for {}: {}", item, device.identity(), e);
                    failed = true;
                }
            }
            if failed {
                report.failed += 1;
            } else {
                report.enqueued += 1;
            }
        }

        Ok(report)
    }

    /// Pull the relay's roster into the store. Failures leave the stored roster as is.
    async fn sync_roster(&self) {
        let roster = match timeout(self.relay_timeout, self.relay.list_devices()).await {
            Ok(Ok(roster)) => roster,
            Ok(Err(e)) => {
                warn!("Roster sync from {} failed: {:#}", self.relay.name(), e);
                return;
            }
            Err(_) => {
                warn!("Roster sync from {} timed out", self.relay.name());
                return;
            }
        };

        let mut synced = 0;
        for entry in roster {
            let Ok(identity) =
                DeviceIdentity::new(Some(entry.udid.clone()), Some(entry.serial_number.clone()))
            else {
                debug!("Skipping roster entry without identity");
                continue;
            };
            match self.devices.upsert(&identity, &DevicePatch::new()).await {
                Ok(_) => synced += 1,
                Err(e) => warn!("Roster sync failed for {}: {}", identity, e),
            }
        }
        debug!("Synced {} devices from {}", synced, self.relay.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayDevice, SimulatedRelay};
    use crate::store::MemoryStore;
    use director_shared::{Flag, Profile, Scope};
    use uuid::Uuid;

    fn configured(build: &str) -> Device {
        let mut device = Device::new(Uuid::new_v4(), &DeviceIdentity::udid("ABC"), now());
        device.flags.initial_tasks_run = true;
        device.build_version = Some(build.into());
        device.last_pushed_build = Some(build.into());
        device.last_info_requested = Some(now());
        device.profiles_revision = 3;
        device
    }

    fn hour() -> Duration {
        Duration::from_secs(3600)
    }

    #[test]
    fn test_plan_in_sync_device_needs_nothing() {
        let device = configured("21A5");
        assert!(plan(&device, 3, &Policy::default(), hour(), now()).is_empty());
    }

    #[test]
    fn test_plan_catalog_drift_repushes() {
        let device = configured("21A5");
        assert_eq!(
            plan(&device, 4, &Policy::default(), hour(), now()),
            vec![WorkItem::Repush { force: false }]
        );
    }

    #[test]
    fn test_plan_build_change_depends_on_policy() {
        let mut device = configured("21A5");
        device.build_version = Some("21B1".into());

        assert_eq!(
            plan(&device, 3, &Policy::default(), hour(), now()),
            vec![WorkItem::Repush { force: true }]
        );

        let policy = Policy {
            push_on_new_build: false,
            ..Policy::default()
        };
        assert!(plan(&device, 3, &policy, hour(), now()).is_empty());
    }

    #[test]
    fn test_plan_awaiting_device_is_evaluated_not_repushed() {
        let mut device = configured("21A5");
        device.flags.initial_tasks_run = false;
        device.flags.awaiting_configuration = true;

        assert_eq!(
            plan(&device, 9, &Policy::default(), hour(), now()),
            vec![WorkItem::Evaluate]
        );
    }

    #[test]
    fn test_plan_stale_info_is_requested() {
        let mut device = configured("21A5");
        device.last_info_requested = Some(now() - chrono::Duration::hours(2));

        assert_eq!(
            plan(&device, 3, &Policy::default(), hour(), now()),
            vec![WorkItem::RequestInfo]
        );
    }

    #[test]
    fn test_plan_skips_device_without_udid() {
        let device = Device::new(Uuid::new_v4(), &DeviceIdentity::serial("C02X"), now());
        assert!(plan(&device, 3, &Policy::default(), hour(), now()).is_empty());
    }

    #[tokio::test]
    async fn test_sweep_syncs_roster_and_queues_work() {
        let store = Arc::new(MemoryStore::new());
        let relay = Arc::new(SimulatedRelay::new());
        relay
            .set_roster(vec![RelayDevice {
                udid: "ABC".into(),
                serial_number: "C02X".into(),
                enrollment_status: true,
            }])
            .await;
        store
            .upsert(
                &DeviceIdentity::udid("DEF"),
                &DevicePatch::new().flag(Flag::AwaitingConfiguration, true),
            )
            .await
            .unwrap();
        store
            .put_profile(Scope::Shared, Profile::new("com.example.wifi", "wifi"))
            .await
            .unwrap();
        let (queue, _receiver) = CheckinQueue::new(16);
        let reconciler = Reconciler::new(
            store.clone(),
            store.clone(),
            relay,
            queue.clone(),
            Policy::default(),
            ReconcileConfig::default(),
            Duration::from_secs(1),
        );

        let report = reconciler.sweep().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.enqueued, 2);
        assert_eq!(report.failed, 0);
        assert!(store.get(&DeviceIdentity::serial("C02X")).await.is_ok());
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn test_sweep_survives_roster_failure_and_full_queue() {
        let store = Arc::new(MemoryStore::new());
        let relay = Arc::new(SimulatedRelay::new());
        relay.set_roster_unavailable(true).await;
        for udid in ["A", "B"] {
            store
                .upsert(&DeviceIdentity::udid(udid), &DevicePatch::new())
                .await
                .unwrap();
        }
        let (queue, _receiver) = CheckinQueue::new(1);
        let reconciler = Reconciler::new(
            store.clone(),
            store.clone(),
            relay,
            queue,
            Policy::default(),
            ReconcileConfig::default(),
            Duration::from_secs(1),
        );

        let report = reconciler.sweep().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.failed, 1);
    }
}
