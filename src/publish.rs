use serde::{Deserialize, Serialize};

use crate::{
    cluster::{ArtifactClass, ArtifactStore},
    error::{Degraded, Result},
    naming::SECRETS_DIR,
};

/// Outcome of a successful publish.
#[derive(Debug)]
pub struct Published {
    pub id: String,
    pub name: String,

    /// Stale same-name artifacts that could not be looked up or removed beforehand.
    pub degraded: Vec<Degraded>,
}

/// Writes new artifacts into the store.
///
/// This is the only path that adds to the artifact catalog.
pub struct ArtifactPublisher<'a> {
    store: &'a dyn ArtifactStore,
}

impl<'a> ArtifactPublisher<'a> {
    pub fn new(store: &'a dyn ArtifactStore) -> Self {
        ArtifactPublisher { store }
    }

    /// Creates `name` with `data`, replacing any artifact already holding that exact name.
    ///
    /// Removing the stale artifact is best effort. If it survives, the store rejects the create
    /// and the error is returned.
    pub async fn publish(&self, class: ArtifactClass, name: &str, data: &[u8]) -> Result<Published> {
        let target = || format!("{} {name}", class.as_str());
        let mut degraded = Vec::new();

        match self.store.list(class, Some(name)).await {
            Ok(existing) => {
                for stale in existing.into_iter().filter(|meta| meta.name == name) {
                    log::debug!("replacing existing {} {name} ({})", class.as_str(), stale.id);

                    match self.store.delete(class, &stale.id).await {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {}
                        Err(err) => degraded.push(Degraded::new("remove stale", target(), err)),
                    }
                }
            }
            Err(err) => degraded.push(Degraded::new("look up stale", target(), err)),
        }

        let id = self.store.create(class, name, data).await?;
        log::info!("published {} {name} ({id})", class.as_str());

        Ok(Published {
            id,
            name: name.to_owned(),
            degraded,
        })
    }
}

/// Dynamic configuration pointing a reverse proxy at the mounted certificate files.
///
/// Renders as a Traefik file-provider document:
///
/// ```yaml
/// tls:
///   certificates:
///   - certFile: /run/secrets/edge_tls_crt
///     keyFile: /run/secrets/edge_tls_key
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfigDocument {
    tls: TlsSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TlsSection {
    certificates: Vec<TlsCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlsCertificate {
    cert_file: String,
    key_file: String,
}

impl TlsConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one certificate by the mount names of its cert and key files.
    pub fn push(&mut self, cert_mount: &str, key_mount: &str) {
        self.tls.certificates.push(TlsCertificate {
            cert_file: format!("{SECRETS_DIR}/{cert_mount}"),
            key_file: format!("{SECRETS_DIR}/{key_mount}"),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.tls.certificates.is_empty()
    }

    pub fn render(&self) -> eyre::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
