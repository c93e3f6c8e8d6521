//! Initial task pipeline and the targeted re-configuration built from its steps
//!
//! This module handles:
//! - Driving a newly enrolled device through its ordered setup steps
//! - Resetting a device back to the pipeline's entry condition
//! - Re-pushing profiles after catalog or build changes
//! - Requesting fresh device information

mod initial_tasks;
mod profiles;

pub use initial_tasks::{InitialTasks, PipelineOutcome};
