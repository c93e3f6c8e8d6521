//! Initial Task Pipeline State Machine
//!
//! Storage keeps two booleans per device (awaiting-configuration and
//! initial-tasks-run). Decisions are made on the state derived from them so
//! the transition table can be checked without a store.

use crate::DeviceFlags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a device in the initial task pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    /// Not in Setup Assistant and never configured
    Idle,
    /// Enrolled and waiting in Setup Assistant, initial tasks not run yet
    AwaitingInitialTasks,
    /// Initial tasks done, device still waiting for the device-configured signal
    AwaitingRelease,
    /// Initial tasks done and the device left Setup Assistant
    Configured,
}

/// What the orchestrator should do for a device in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do
    None,
    /// Run the initial task pipeline
    RunInitialTasks,
    /// Re-send the device-configured signal without re-running anything
    AnnounceConfigured,
}

/// Things that move a device between pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The device reported its awaiting-configuration flag
    AwaitingReported(bool),
    /// The pipeline finished its last step
    InitialTasksCompleted,
    /// An operator or re-enrollment reset the device
    Reset,
}

impl PipelineState {
    pub fn from_flags(flags: &DeviceFlags) -> Self {
        Self::from_parts(flags.awaiting_configuration, flags.initial_tasks_run)
    }

    pub fn from_parts(awaiting_configuration: bool, initial_tasks_run: bool) -> Self {
        match (awaiting_configuration, initial_tasks_run) {
            (false, false) => PipelineState::Idle,
            (true, false) => PipelineState::AwaitingInitialTasks,
            (true, true) => PipelineState::AwaitingRelease,
            (false, true) => PipelineState::Configured,
        }
    }

    /// Flag values (awaiting-configuration, initial-tasks-run) that encode this state
    pub fn flags(self) -> (bool, bool) {
        match self {
            PipelineState::Idle => (false, false),
            PipelineState::AwaitingInitialTasks => (true, false),
            PipelineState::AwaitingRelease => (true, true),
            PipelineState::Configured => (false, true),
        }
    }

    pub fn decision(self) -> Decision {
        match self {
            PipelineState::AwaitingInitialTasks => Decision::RunInitialTasks,
            PipelineState::AwaitingRelease => Decision::AnnounceConfigured,
            PipelineState::Idle | PipelineState::Configured => Decision::None,
        }
    }

    /// Next state after an event. Every event is total: re-delivering one is a no-op.
    pub fn next(self, event: PipelineEvent) -> PipelineState {
        let (awaiting, run) = self.flags();
        match event {
            PipelineEvent::AwaitingReported(awaiting) => Self::from_parts(awaiting, run),
            PipelineEvent::InitialTasksCompleted => Self::from_parts(awaiting, true),
            PipelineEvent::Reset => Self::from_parts(awaiting, false),
        }
    }
}

/// Steps of the initial task pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStep {
    ResetProfiles,
    ClearCommands,
    InstallProfiles,
    InstallBootstrapPackages,
    MarkConfigured,
}

impl PipelineStep {
    /// Steps to run for a device, honoring the reset-profiles policy
    pub fn plan(reset_profiles: bool) -> Vec<PipelineStep> {
        let mut steps = Vec::with_capacity(5);
        if reset_profiles {
            steps.push(PipelineStep::ResetProfiles);
        }
        steps.extend([
            PipelineStep::ClearCommands,
            PipelineStep::InstallProfiles,
            PipelineStep::InstallBootstrapPackages,
            PipelineStep::MarkConfigured,
        ]);
        steps
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStep::ResetProfiles => "reset profiles",
            PipelineStep::ClearCommands => "clear commands",
            PipelineStep::InstallProfiles => "install profiles",
            PipelineStep::InstallBootstrapPackages => "install bootstrap packages",
            PipelineStep::MarkConfigured => "mark configured",
        };
        f.write_str(name)
    }
}
