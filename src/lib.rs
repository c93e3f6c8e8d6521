//! Fleet Director
//!
//! Drives enrolled devices to a configured state by issuing commands through
//! a relay and reacting to the events the relay delivers back.

pub mod command;
pub mod config;
pub mod director;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod relay;
pub mod store;

pub use config::{Cli, DirectorConfig, Policy};
pub use director::Director;
pub use error::{DirectorError, Result};
