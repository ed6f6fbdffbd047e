//! Docker Engine API adapter.
//!
//! Talks HTTP to the engine, either over its local socket (`unix://`, the default) or over a
//! TCP endpoint such as a socket proxy.

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::Method;
use serde_json::{Map, Value};

use crate::{
    api::{Artifact, ArtifactSpec, IdResponse, Service, ServiceSpec},
    cluster::{ArtifactClass, ArtifactMeta, ArtifactStore, ServiceRegistry},
    error::*,
    req::{read_json, req_handle_error, EngineResponse, Transport},
};

/// Client for the Swarm endpoints of a Docker Engine.
#[derive(Debug, Clone)]
pub struct DockerClient {
    transport: Transport,
    endpoint: String,
}

impl DockerClient {
    /// Creates a client from a `DOCKER_HOST` style address.
    ///
    /// Accepts `unix://`, `tcp://`, `http://` and `https://` hosts; `tcp` means plain HTTP.
    pub fn new(host: &str) -> eyre::Result<DockerClient> {
        let host = host.trim();

        if let Some(socket) = host.strip_prefix("unix://") {
            return DockerClient::unix(socket);
        }

        let host = host.trim_end_matches('/');

        let base_url = if let Some(addr) = host.strip_prefix("tcp://") {
            format!("http://{addr}")
        } else if host.starts_with("http://") || host.starts_with("https://") {
            host.to_owned()
        } else {
            eyre::bail!("unsupported DOCKER_HOST {host}");
        };

        Ok(DockerClient {
            transport: Transport::http(base_url.clone())?,
            endpoint: base_url,
        })
    }

    #[cfg(unix)]
    fn unix(socket: &str) -> eyre::Result<DockerClient> {
        if socket.is_empty() {
            eyre::bail!("DOCKER_HOST unix:// names no socket");
        }

        Ok(DockerClient {
            transport: Transport::Unix {
                socket: socket.into(),
            },
            endpoint: format!("unix://{socket}"),
        })
    }

    #[cfg(not(unix))]
    fn unix(socket: &str) -> eyre::Result<DockerClient> {
        eyre::bail!("unix socket DOCKER_HOST unix://{socket} is not supported on this platform")
    }

    /// Where the engine is reached, for logging.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<EngineResponse> {
        self.transport.send(Method::GET, path, query, None).await
    }

    async fn post(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &impl serde::Serialize,
    ) -> Result<EngineResponse> {
        let body = serde_json::to_vec(body)?;
        self.transport.send(Method::POST, path, query, Some(body)).await
    }
}

fn collection(class: ArtifactClass) -> &'static str {
    match class {
        ArtifactClass::Secret => "/secrets",
        ArtifactClass::Config => "/configs",
    }
}

/// Renders the `filters` query parameter, e.g. `{"label":{"a=b":true}}`.
fn filters<'a>(key: &str, values: impl IntoIterator<Item = &'a str>) -> String {
    let values = values
        .into_iter()
        .map(|value| (value.to_owned(), Value::Bool(true)))
        .collect::<Map<_, _>>();

    let mut filters = Map::new();
    filters.insert(key.to_owned(), Value::Object(values));
    Value::Object(filters).to_string()
}

#[async_trait]
impl ArtifactStore for DockerClient {
    async fn list(&self, class: ArtifactClass, name: Option<&str>) -> Result<Vec<ArtifactMeta>> {
        let query = name
            .map(|name| vec![("filters", filters("name", [name]))])
            .unwrap_or_default();

        let res = req_handle_error(self.get(collection(class), &query).await?)?;
        let artifacts = read_json::<Vec<Artifact>>(&res)?;

        Ok(artifacts.into_iter().map(ArtifactMeta::from).collect())
    }

    async fn create(&self, class: ArtifactClass, name: &str, data: &[u8]) -> Result<String> {
        let body = ArtifactSpec {
            name: name.to_owned(),
            data: Some(BASE64_STANDARD.encode(data)),
        };

        let path = format!("{}/create", collection(class));
        let res = match req_handle_error(self.post(&path, &[], &body).await?) {
            Err(ClusterError::Api { status: 409, .. }) => {
                return Err(ClusterError::NameConflict(name.to_owned()))
            }
            res => res?,
        };

        Ok(read_json::<IdResponse>(&res)?.id)
    }

    async fn delete(&self, class: ArtifactClass, id: &str) -> Result<()> {
        let path = format!("{}/{id}", collection(class));
        let res = self.transport.send(Method::DELETE, &path, &[], None).await?;

        match req_handle_error(res) {
            Err(ClusterError::Api { status: 404, .. }) => Err(ClusterError::NotFound(id.to_owned())),
            res => res.map(drop),
        }
    }
}

#[async_trait]
impl ServiceRegistry for DockerClient {
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<Service>> {
        let labels = labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();

        let query = [("filters", filters("label", labels.iter().map(String::as_str)))];
        let res = req_handle_error(self.get("/services", &query).await?)?;

        read_json(&res)
    }

    async fn inspect(&self, service_id: &str) -> Result<Service> {
        let res = self.get(&format!("/services/{service_id}"), &[]).await?;

        match req_handle_error(res) {
            Err(ClusterError::Api { status: 404, .. }) => {
                Err(ClusterError::NotFound(service_id.to_owned()))
            }
            res => read_json(&res?),
        }
    }

    async fn update(&self, service_id: &str, version: u64, spec: &ServiceSpec) -> Result<()> {
        let path = format!("/services/{service_id}/update");
        let res = self
            .post(&path, &[("version", version.to_string())], spec)
            .await?;

        match req_handle_error(res) {
            Err(ClusterError::Api { status, message })
                if status == 409 || message.is_out_of_sequence() =>
            {
                log::debug!("update of {service_id} rejected: {message}");
                Err(ClusterError::VersionConflict {
                    service: service_id.to_owned(),
                    version,
                })
            }
            Err(ClusterError::Api { status: 404, .. }) => {
                Err(ClusterError::NotFound(service_id.to_owned()))
            }
            res => {
                // the body only carries warnings, the update itself already succeeded
                let res = serde_json::from_str::<UpdateResponse>(&res?.body).unwrap_or_default();
                for warning in res.warnings {
                    log::warn!("service {service_id}: {warning}");
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct UpdateResponse {
    #[serde(rename = "Warnings", default, deserialize_with = "null_as_empty")]
    warnings: Vec<String>,
}

fn null_as_empty<'de, D>(de: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize as _;
    Ok(Option::<Vec<String>>::deserialize(de)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::test::with_engine_socket;
    use crate::test::with_engine_server;

    #[test]
    fn test_host_parsing() {
        let client = DockerClient::new("tcp://docker-proxy:2375").unwrap();
        assert_eq!(client.endpoint(), "http://docker-proxy:2375");

        let client = DockerClient::new("https://engine.internal/").unwrap();
        assert_eq!(client.endpoint(), "https://engine.internal");

        #[cfg(unix)]
        {
            let client = DockerClient::new("unix:///var/run/docker.sock").unwrap();
            assert_eq!(client.endpoint(), "unix:///var/run/docker.sock");
            assert!(DockerClient::new("unix://").is_err());
        }

        assert!(DockerClient::new("docker-proxy:2375").is_err());
    }

    #[test]
    fn test_filters() {
        assert_eq!(
            filters("label", ["edge.traefik.service=true"]),
            r#"{"label":{"edge.traefik.service=true":true}}"#
        );
    }

    #[tokio::test]
    async fn test_list_services() {
        let server = with_engine_server();
        let client = DockerClient::new(&server.url).unwrap();

        let labels = [("edge.traefik.service".to_owned(), "true".to_owned())];
        let services = ServiceRegistry::list(&client, &labels).await.unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "svc1");
        assert_eq!(services[0].name(), "edge_traefik");
        assert_eq!(services[0].version.index, 19);

        // an unmatched filter reaches the engine and yields nothing
        let labels = [("other".to_owned(), "x".to_owned())];
        assert!(ServiceRegistry::list(&client, &labels).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_over_socket() {
        let server = with_engine_socket();
        let client = DockerClient::new(&server.url).unwrap();

        let labels = [("edge.traefik.service".to_owned(), "true".to_owned())];
        let services = ServiceRegistry::list(&client, &labels).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "svc1");

        client
            .update("svc1", 19, &services[0].spec)
            .await
            .unwrap();

        let id = client
            .create(ArtifactClass::Secret, "edge_tls_crt_202402010000", b"CERT")
            .await
            .unwrap();
        assert_eq!(id, "s2");

        let err = client.inspect("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let host = format!("unix://{}", dir.path().join("docker.sock").display());
        let client = DockerClient::new(&host).unwrap();

        let err = ArtifactStore::list(&client, ArtifactClass::Secret, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Io(_)));
    }

    #[tokio::test]
    async fn test_inspect_and_update() {
        let server = with_engine_server();
        let client = DockerClient::new(&server.url).unwrap();

        let service = client.inspect("svc1").await.unwrap();
        client
            .update("svc1", service.version.index, &service.spec)
            .await
            .unwrap();

        let err = client.update("svc1", 18, &service.spec).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::VersionConflict { version: 18, .. }
        ));

        let err = client.inspect("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_artifacts() {
        let server = with_engine_server();
        let client = DockerClient::new(&server.url).unwrap();

        let secrets = ArtifactStore::list(&client, ArtifactClass::Secret, None)
            .await
            .unwrap();
        assert_eq!(
            secrets,
            [ArtifactMeta {
                id: "s1".to_owned(),
                name: "edge_tls_crt_202401010000".to_owned()
            }]
        );

        let id = client
            .create(ArtifactClass::Secret, "edge_tls_crt_202402010000", b"CERT")
            .await
            .unwrap();
        assert_eq!(id, "s2");

        let err = client
            .create(ArtifactClass::Config, "certs_202402010000.yml", b"tls: {}")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NameConflict(_)));

        client.delete(ArtifactClass::Secret, "s1").await.unwrap();
        let err = client
            .delete(ArtifactClass::Secret, "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
