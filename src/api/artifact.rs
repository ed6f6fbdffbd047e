use serde::{Deserialize, Serialize};

use crate::cluster::ArtifactMeta;

/// A secret or config object as listed by `GET /secrets` and `GET /configs`.
///
/// The payload itself is never returned by the engine for secrets, and not needed for configs.
///
/// # Example JSON
///
/// ```json
/// {
///   "ID": "ktnbjxoalbkvbvedmg1urrz8h",
///   "Version": { "Index": 11 },
///   "CreatedAt": "2024-01-01T00:00:00.000000000Z",
///   "Spec": { "Name": "edge_tls_crt_202401010000", "Labels": {} }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Artifact {
    #[serde(rename = "ID")]
    pub id: String,

    pub spec: ArtifactSpec,
}

impl From<Artifact> for ArtifactMeta {
    fn from(artifact: Artifact) -> Self {
        ArtifactMeta {
            id: artifact.id,
            name: artifact.spec.name,
        }
    }
}

/// Body of `POST /secrets/create` and `POST /configs/create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArtifactSpec {
    pub name: String,

    /// Base64 encoded payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Response of the create endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdResponse {
    #[serde(rename = "ID", alias = "Id")]
    pub id: String,
}
