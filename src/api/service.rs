use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A Swarm service as returned by `GET /services` and `GET /services/{id}`.
///
/// # Example JSON
///
/// ```json
/// {
///   "ID": "9mnpnzenvg8p8tdbtq4wvbkcz",
///   "Version": { "Index": 19 },
///   "Spec": {
///     "Name": "edge_traefik",
///     "Labels": { "edge.traefik.service": "true" },
///     "TaskTemplate": {
///       "ContainerSpec": {
///         "Image": "traefik:v3.1",
///         "Secrets": [
///           {
///             "File": { "Name": "edge_tls_crt", "UID": "0", "GID": "0", "Mode": 256 },
///             "SecretID": "ktnbjxoalbkvbvedmg1urrz8h",
///             "SecretName": "edge_tls_crt_202401010000"
///           }
///         ]
///       },
///       "ForceUpdate": 0
///     },
///     "UpdateConfig": { "Parallelism": 1, "Order": "stop-first" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(default)]
    pub version: Version,

    #[serde(default)]
    pub spec: ServiceSpec,
}

impl Service {
    /// Display name, falling back to the ID for unnamed services.
    pub fn name(&self) -> &str {
        if self.spec.name.is_empty() {
            &self.id
        } else {
            &self.spec.name
        }
    }
}

/// Optimistic concurrency token of a Swarm object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    pub index: u64,
}

/// User-modifiable service configuration.
///
/// Only the fields the rotator reads or writes are typed; everything else is carried in
/// `extra` and sent back unchanged on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default)]
    pub task_template: TaskTemplate,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_config: Option<UpdateConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskTemplate {
    #[serde(default)]
    pub container_spec: ContainerSpec,

    /// Counter that triggers a rolling update whenever it changes.
    #[serde(default)]
    pub force_update: u64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ConfigReference>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Attachment of a secret to a service's containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretReference {
    #[serde(rename = "SecretID")]
    pub secret_id: String,

    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileTarget>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Attachment of a config to a service's containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigReference {
    #[serde(rename = "ConfigID")]
    pub config_id: String,

    pub config_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileTarget>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where and how a referenced artifact appears inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileTarget {
    pub name: String,

    #[serde(rename = "UID")]
    pub uid: String,

    #[serde(rename = "GID")]
    pub gid: String,

    pub mode: u32,
}

impl FileTarget {
    /// Root-owned file with the given mode.
    pub fn new(name: impl Into<String>, mode: u32) -> FileTarget {
        FileTarget {
            name: name.into(),
            uid: "0".to_owned(),
            gid: "0".to_owned(),
            mode,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<UpdateOrder>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Order of task replacement during a rolling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateOrder {
    StopFirst,
    StartFirst,
}

/// Common view over secret and config references.
pub trait Reference {
    /// Name of the referenced artifact.
    fn artifact_name(&self) -> &str;

    /// In-container file name, if the reference is mounted as a file.
    fn mount_name(&self) -> Option<&str>;
}

impl Reference for SecretReference {
    fn artifact_name(&self) -> &str {
        &self.secret_name
    }

    fn mount_name(&self) -> Option<&str> {
        self.file.as_ref().map(|file| file.name.as_str())
    }
}

impl Reference for ConfigReference {
    fn artifact_name(&self) -> &str {
        &self.config_name
    }

    fn mount_name(&self) -> Option<&str> {
        self.file.as_ref().map(|file| file.name.as_str())
    }
}
