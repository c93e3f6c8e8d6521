//! In-process relay for development and tests

use super::{RelayClient, RelayDevice};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use director_shared::{CommandKind, CommandRequest};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A request the simulated relay accepted
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub command_uuid: String,
    pub request: CommandRequest,
}

impl SentCommand {
    pub fn request_type(&self) -> &str {
        &self.request.request_type
    }
}

#[derive(Default)]
struct State {
    sent: Vec<SentCommand>,
    failing: HashSet<&'static str>,
    roster: Vec<RelayDevice>,
    roster_unavailable: bool,
    in_flight: HashMap<String, Arc<AtomicUsize>>,
    max_overlap: HashMap<String, usize>,
}

/// Counts one enqueue in flight until dropped, so a cancelled call is released too
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records every command instead of delivering it
#[derive(Default)]
pub struct SimulatedRelay {
    state: Mutex<State>,
    latency: Duration,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every enqueue for `latency` so overlapping calls become visible
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::default(),
            latency,
        }
    }

    /// Make every enqueue of `kind` fail
    pub async fn fail_kind(&self, kind: CommandKind) {
        self.state.lock().await.failing.insert(kind.request_type());
    }

    pub async fn heal(&self) {
        self.state.lock().await.failing.clear();
    }

    pub async fn set_roster(&self, devices: Vec<RelayDevice>) {
        self.state.lock().await.roster = devices;
    }

    pub async fn set_roster_unavailable(&self, unavailable: bool) {
        self.state.lock().await.roster_unavailable = unavailable;
    }

    pub async fn sent(&self) -> Vec<SentCommand> {
        self.state.lock().await.sent.clone()
    }

    /// Commands of one kind sent to one device
    pub async fn count(&self, udid: &str, kind: CommandKind) -> usize {
        self.state
            .lock()
            .await
            .sent
            .iter()
            .filter(|c| c.request.udid == udid && c.request_type() == kind.request_type())
            .count()
    }

    /// Highest number of enqueues ever in flight at once for a device
    pub async fn max_overlap(&self, udid: &str) -> usize {
        self.state
            .lock()
            .await
            .max_overlap
            .get(udid)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RelayClient for SimulatedRelay {
    async fn enqueue(&self, request: &CommandRequest) -> Result<String> {
        let guard = {
            let mut state = self.state.lock().await;
            if state.failing.contains(request.request_type.as_str()) {
                return Err(anyhow!("simulated relay rejected {}", request.request_type));
            }
            let counter = state
                .in_flight
                .entry(request.udid.clone())
                .or_default()
                .clone();
            let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let max = state.max_overlap.entry(request.udid.clone()).or_insert(0);
            *max = (*max).max(current);
            InFlight(counter)
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let command_uuid = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        drop(guard);
        state.sent.push(SentCommand {
            command_uuid: command_uuid.clone(),
            request: request.clone(),
        });
        Ok(command_uuid)
    }

    async fn list_devices(&self) -> Result<Vec<RelayDevice>> {
        let state = self.state.lock().await;
        if state.roster_unavailable {
            return Err(anyhow!("simulated relay roster unavailable"));
        }
        Ok(state.roster.clone())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_shared::CommandSpec;

    #[tokio::test]
    async fn test_records_and_counts() {
        let relay = SimulatedRelay::new();
        let spec = CommandSpec::new(CommandKind::DeviceConfigured);
        relay.enqueue(&CommandRequest::new("ABC", &spec)).await.unwrap();
        relay.enqueue(&CommandRequest::new("ABC", &spec)).await.unwrap();
        relay.enqueue(&CommandRequest::new("DEF", &spec)).await.unwrap();

        assert_eq!(relay.count("ABC", CommandKind::DeviceConfigured).await, 2);
        assert_eq!(relay.count("DEF", CommandKind::DeviceConfigured).await, 1);
        assert_eq!(relay.max_overlap("ABC").await, 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let relay = SimulatedRelay::new();
        relay.fail_kind(CommandKind::InstallProfile).await;

        let spec = CommandSpec::new(CommandKind::InstallProfile);
        assert!(relay.enqueue(&CommandRequest::new("ABC", &spec)).await.is_err());
        assert!(relay.sent().await.is_empty());

        relay.heal().await;
        assert!(relay.enqueue(&CommandRequest::new("ABC", &spec)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_leaves_no_overlap_behind() {
        let relay = SimulatedRelay::with_latency(Duration::from_millis(100));
        let spec = CommandSpec::new(CommandKind::DeviceConfigured);
        let request = CommandRequest::new("ABC", &spec);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), relay.enqueue(&request)).await;
        assert!(cancelled.is_err());
        assert_eq!(relay.max_overlap("ABC").await, 1);

        relay.enqueue(&request).await.unwrap();
        assert_eq!(relay.max_overlap("ABC").await, 1);
        assert_eq!(relay.count("ABC", CommandKind::DeviceConfigured).await, 1);
    }
}
