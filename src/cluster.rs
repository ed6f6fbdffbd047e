//! Capabilities the rotator needs from the outside world.
//!
//! The cycle in [`crate::Rotator`] only talks to these traits. [`crate::swarm::DockerClient`]
//! implements the store and registry against a Docker Engine, [`crate::lego::LegoIssuer`]
//! implements the issuer.

use async_trait::async_trait;

use crate::{
    api::{Service, ServiceSpec},
    cert::Certificate,
    error::Result,
};

/// Which artifact collection an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactClass {
    Secret,
    Config,
}

impl ArtifactClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactClass::Secret => "secret",
            ArtifactClass::Config => "config",
        }
    }
}

/// Identity and name of an artifact held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactMeta {
    pub id: String,
    pub name: String,
}

/// Immutable named blobs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Lists artifacts of `class`; with `name` set, only artifacts whose name matches.
    ///
    /// Name matching may be fuzzy on the store side, callers compare names exactly.
    async fn list(&self, class: ArtifactClass, name: Option<&str>) -> Result<Vec<ArtifactMeta>>;

    /// Creates an artifact and returns its ID.
    async fn create(&self, class: ArtifactClass, name: &str, data: &[u8]) -> Result<String>;

    async fn delete(&self, class: ArtifactClass, id: &str) -> Result<()>;
}

/// Running services and their specifications.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Lists services carrying every `key=value` label in `labels`.
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<Service>>;

    /// Fetches the current spec and version token of a service.
    async fn inspect(&self, service_id: &str) -> Result<Service>;

    /// Replaces the spec of a service.
    ///
    /// Fails with [`ClusterError::VersionConflict`] if `version` is no longer current.
    ///
    /// [`ClusterError::VersionConflict`]: crate::ClusterError::VersionConflict
    async fn update(&self, service_id: &str, version: u64, spec: &ServiceSpec) -> Result<()>;
}

/// ACME account the issuer registers and orders with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeAccount {
    pub email: String,

    /// Directory URL; the issuer's default CA when unset.
    pub server: Option<String>,

    pub external_binding: Option<ExternalAccountBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAccountBinding {
    pub key_id: String,
    pub hmac_key: String,
}

/// Obtains certificates.
///
/// Failures are not distinguished; the caller skips the domain group for this pass.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn obtain(&self, account: &AcmeAccount, domains: &[String])
        -> eyre::Result<Certificate>;
}
