//! Configuration profiles and applications assigned to devices

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Who an assignment applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every device
    Shared,
    /// One device, by stored device id
    Device(Uuid),
}

/// The profile or application a command installs, with the content hash sent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub identifier: String,
    pub hash: String,
}

/// A configuration profile. The payload is opaque here; signing happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub identifier: String,
    pub payload: String,
    pub hash: String,
}

impl Profile {
    /// Build a profile, hashing the payload so content changes are detectable
    pub fn new(identifier: impl Into<String>, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let hash = format!("{:x}", Sha256::digest(payload.as_bytes()));
        Self {
            identifier: identifier.into(),
            payload,
            hash,
        }
    }

    pub fn subject(&self) -> Subject {
        Subject {
            identifier: self.identifier.clone(),
            hash: self.hash.clone(),
        }
    }
}

/// An application installed from a manifest URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallApplication {
    pub manifest_url: String,
    /// Install during the initial task pipeline
    pub bootstrap: bool,
}

impl InstallApplication {
    pub fn subject(&self) -> Subject {
        Subject {
            identifier: self.manifest_url.clone(),
            hash: self.manifest_url.clone(),
        }
    }
}
