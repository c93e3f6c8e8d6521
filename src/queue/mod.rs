//! Checkin queue
//!
//! This module handles:
//! - Accepting work for a device without blocking the producer
//! - Coalescing repeated work for a device already queued or in flight
//! - Running at most one unit of work per device at any instant
//! - Reporting when every device slot has drained

mod processor;

pub use processor::{CheckinQueue, QueueReceiver, WorkHandler};

use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// One kind of work a device can be queued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// Re-check the pipeline decision for the device's current flags
    Evaluate,
    /// Push profiles again; `force` ignores installed markers
    Repush { force: bool },
    /// Refresh device information, security state and profile list
    RequestInfo,
    /// Return the device to the pipeline's entry condition
    Reset,
    /// Drop the device's pending commands
    ClearPending,
    /// Wipe the device, at most once per intent
    Erase { intent: Uuid },
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Evaluate => write!(f, "evaluate"),
            WorkItem::Repush { force: true } => write!(f, "forced repush"),
            WorkItem::Repush { force: false } => write!(f, "repush"),
            WorkItem::RequestInfo => write!(f, "request info"),
            WorkItem::Reset => write!(f, "reset"),
            WorkItem::ClearPending => write!(f, "clear pending"),
            WorkItem::Erase { intent } => write!(f, "erase ({})", intent),
        }
    }
}

/// Work accumulated for one device while its slot is queued or busy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWork {
    reset: bool,
    clear_pending: bool,
    evaluate: bool,
    /// `Some(force)` when a repush is wanted
    repush: Option<bool>,
    request_info: bool,
    erase: BTreeSet<Uuid>,
}

impl PendingWork {
    pub fn add(&mut self, item: WorkItem) {
        match item {
            WorkItem::Evaluate => self.evaluate = true,
            WorkItem::Repush { force } => {
                self.repush = Some(self.repush.unwrap_or(false) || force);
            }
            WorkItem::RequestInfo => self.request_info = true,
            WorkItem::Reset => self.reset = true,
            WorkItem::ClearPending => self.clear_pending = true,
            WorkItem::Erase { intent } => {
                self.erase.insert(intent);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Items in execution order: reset, clear pending, evaluate, repush,
    /// request info, then erases
    pub fn items(&self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        if self.reset {
            items.push(WorkItem::Reset);
        }
        if self.clear_pending {
            items.push(WorkItem::ClearPending);
        }
        if self.evaluate {
            items.push(WorkItem::Evaluate);
        }
        if let Some(force) = self.repush {
            items.push(WorkItem::Repush { force });
        }
        if self.request_info {
            items.push(WorkItem::RequestInfo);
        }
        items.extend(self.erase.iter().map(|&intent| WorkItem::Erase { intent }));
        items
    }
}

impl From<WorkItem> for PendingWork {
    fn from(item: WorkItem) -> Self {
        let mut work = Self::default();
        work.add(item);
        work
    }
}
