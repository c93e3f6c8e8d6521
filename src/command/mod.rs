//! Command dispatch and acknowledgement tracking
//!
//! This module handles:
//! - Sending typed commands to the relay on behalf of a device
//! - Recording what was sent as pending
//! - Correlating later acknowledgements by relay-assigned UUID
//! - Discarding stale pending commands before a pipeline run

mod gateway;

pub use gateway::{AckOutcome, CommandGateway};
