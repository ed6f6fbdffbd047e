//! Docker Engine JSON payloads.
//!
//! The service types double as the rotator's model of a service specification, so the
//! rewriting logic works directly on what the engine returns.

use std::fmt;

use serde::{Deserialize, Serialize};

mod artifact;
mod service;

pub use self::{
    artifact::{Artifact, ArtifactSpec, IdResponse},
    service::{
        ConfigReference, ContainerSpec, FileTarget, Reference, SecretReference, Service,
        ServiceSpec, TaskTemplate, UpdateConfig, UpdateOrder, Version,
    },
};

/// Error body returned by the engine for non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
}

impl ErrorMessage {
    /// Returns true if the engine rejected an update carrying a stale version index.
    pub fn is_out_of_sequence(&self) -> bool {
        self.message.contains("update out of sequence")
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
