//! Error taxonomy for the orchestrator core

use director_shared::{CommandKind, IdentityMissing, PipelineStep};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, DirectorError>;

#[derive(Error, Debug)]
pub enum DirectorError {
    /// No usable device key was supplied
    #[error(transparent)]
    IdentityMissing(#[from] IdentityMissing),

    #[error("not found: {0}")]
    NotFound(String),

    /// The relay call failed or timed out
    #[error("dispatch of {kind} to {udid} failed: {message}")]
    DispatchFailed {
        udid: String,
        kind: CommandKind,
        message: String,
    },

    /// Persistence failed; the step it belonged to did not complete
    #[error("store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("{kind} is destructive and needs an explicit intent")]
    IntentRequired { kind: CommandKind },

    /// Another send holding the same intent has not been recorded yet
    #[error("{kind} for intent {intent} is already being dispatched")]
    IntentInFlight { kind: CommandKind, intent: Uuid },

    #[error("checkin queue is full")]
    QueueFull,

    /// A pipeline step failed and the run was aborted
    #[error("initial tasks aborted at {step}: {source}")]
    Step {
        step: PipelineStep,
        #[source]
        source: Box<DirectorError>,
    },
}

impl DirectorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreWriteFailed(message.into())
    }

    /// Wrap this error with the pipeline step it came from
    pub fn at_step(self, step: PipelineStep) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping step wrappers
    pub fn root(&self) -> &DirectorError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status the routing layer should answer with
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Self::IdentityMissing(_) | Self::IntentRequired { .. } => 400,
            Self::NotFound(_) => 404,
            Self::IntentInFlight { .. } => 409,
            Self::QueueFull => 503,
            Self::DispatchFailed { .. } => 502,
            Self::StoreWriteFailed(_) | Self::Step { .. } => 500,
        }
    }

    /// Generic description safe to return to an unauthenticated caller
    pub fn public_message(&self) -> &'static str {
        match self.status_code() {
            400 => "bad request",
            404 => "not found",
            409 => "conflict",
            502 => "upstream error",
            503 => "service busy",
            _ => "internal error",
        }
    }
}
