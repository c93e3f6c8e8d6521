//! Queue handle and worker pool

use super::{PendingWork, WorkItem};
use crate::error::{DirectorError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Processes one coalesced unit of work for a device
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn process(&self, device_id: Uuid, work: PendingWork) -> Result<()>;
}

/// Per-device slots. A device has an entry while it is queued or in flight.
struct Slots {
    pending: Mutex<HashMap<Uuid, PendingWork>>,
    idle: Notify,
}

/// Producer side of the checkin queue
#[derive(Clone)]
pub struct CheckinQueue {
    slots: Arc<Slots>,
    tx: mpsc::Sender<Uuid>,
}

/// Consumer side, turned into a worker pool with [`QueueReceiver::spawn_workers`]
pub struct QueueReceiver {
    slots: Arc<Slots>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
}

impl CheckinQueue {
    /// Create a queue holding at most `capacity` waiting devices
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let slots = Arc::new(Slots {
            pending: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        });
        (
            Self {
                slots: slots.clone(),
                tx,
            },
            QueueReceiver {
                slots,
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Queue work for a device. Never waits for the work to run.
    ///
    /// Work for a device that already holds a slot is merged into it and
    /// picked up by the worker that owns the slot.
    pub async fn enqueue(&self, device_id: Uuid, item: WorkItem) -> Result<()> {
        let mut pending = self.slots.pending.lock().await;

        if let Some(work) = pending.get_mut(&device_id) {
            work.add(item);
            debug!("Coalesced {} for device {}", item, device_id);
            return Ok(());
        }

        match self.tx.try_send(device_id) {
            Ok(()) => {
                pending.insert(device_id, PendingWork::from(item));
                debug!("Queued {} for device {}", item, device_id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!("Checkin queue full, dropping {} for device {}", item, device_id);
                Err(DirectorError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                error!("Checkin queue closed, dropping {} for device {}", item, device_id);
                Err(DirectorError::QueueFull)
            }
        }
    }

    /// Number of devices queued or in flight
    pub async fn depth(&self) -> usize {
        self.slots.pending.lock().await.len()
    }

    /// Wait until no device is queued or in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.slots.idle.notified();
            if self.slots.pending.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl QueueReceiver {
    /// Start `workers` tasks sharing the receiver
    pub fn spawn_workers(self, handler: Arc<dyn WorkHandler>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let slots = self.slots.clone();
                let rx = self.rx.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    run_worker(worker, slots, rx, handler).await;
                })
            })
            .collect()
    }
}

async fn run_worker(
    worker: usize,
    slots: Arc<Slots>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    handler: Arc<dyn WorkHandler>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(device_id) = next else {
            debug!("Checkin worker {} stopping", worker);
            break;
        };

        // Drain the slot; work added while processing is picked up on the next pass
        loop {
            let work = {
                let mut pending = slots.pending.lock().await;
                match pending.get_mut(&device_id) {
                    Some(work) if !work.is_empty() => std::mem::take(work),
                    _ => {
                        pending.remove(&device_id);
                        if pending.is_empty() {
                            slots.idle.notify_waiters();
                        }
                        break;
                    }
                }
            };

            if let Err(e) = handler.process(device_id, work).await {
                error!("Worker {} failed processing device {}: {}", worker, device_id, e);
            }
        }
    }
}
