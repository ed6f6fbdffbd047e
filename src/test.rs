use std::{collections::HashSet, convert::Infallible, future::ready, net::TcpListener};

use actix_http::{body::MessageBody, HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use async_trait::async_trait;
use eyre::eyre;
use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};
use zeroize::Zeroizing;

use crate::{
    api::{ErrorMessage, Service, ServiceSpec},
    cert::Certificate,
    cluster::{
        AcmeAccount, ArtifactClass, ArtifactMeta, ArtifactStore, CertificateIssuer,
        ServiceRegistry,
    },
    error::{ClusterError, Result},
};

/// Self-signed certificate for `domains`, valid until `not_after`.
pub fn self_signed(domains: &[&str], not_after: OffsetDateTime) -> Certificate {
    let names = domains.iter().map(|d| d.to_string()).collect::<Vec<_>>();

    let mut params = rcgen::CertificateParams::new(names).unwrap();
    params.not_before = not_after - Duration::days(90);
    params.not_after = not_after;

    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    Certificate::new(Zeroizing::new(key.serialize_pem()), cert.pem())
}

#[derive(Debug)]
struct StoredArtifact {
    class: ArtifactClass,
    id: String,
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    artifacts: Vec<StoredArtifact>,
    pinned: HashSet<String>,
    failing: Vec<String>,
    created: Vec<String>,
}

/// In-memory artifact store with engine-like semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Seeds an artifact, bypassing failure injection.
    pub fn insert(&self, class: ArtifactClass, name: &str, data: &[u8]) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}{}", &class.as_str()[..1], state.next_id);

        state.artifacts.push(StoredArtifact {
            class,
            id: id.clone(),
            name: name.to_owned(),
            data: data.to_vec(),
        });

        id
    }

    pub fn data(&self, class: ArtifactClass, name: &str) -> Option<Vec<u8>> {
        self.find(class, name, |artifact| artifact.data.clone())
    }

    pub fn id_of(&self, class: ArtifactClass, name: &str) -> Option<String> {
        self.find(class, name, |artifact| artifact.id.clone())
    }

    fn find<T>(
        &self,
        class: ArtifactClass,
        name: &str,
        f: impl FnOnce(&StoredArtifact) -> T,
    ) -> Option<T> {
        self.state
            .lock()
            .artifacts
            .iter()
            .find(|artifact| artifact.class == class && artifact.name == name)
            .map(f)
    }

    /// Sorted names of every artifact of `class`.
    pub fn names(&self, class: ArtifactClass) -> Vec<String> {
        let mut names = self
            .state
            .lock()
            .artifacts
            .iter()
            .filter(|artifact| artifact.class == class)
            .map(|artifact| artifact.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Makes deletion of `name` fail, as for an artifact still in use.
    pub fn pin(&self, name: &str) {
        self.state.lock().pinned.insert(name.to_owned());
    }

    /// Makes creation of any name starting with `prefix` fail.
    pub fn fail_creates(&self, prefix: &str) {
        self.state.lock().failing.push(prefix.to_owned());
    }

    /// Names passed to successful `create` calls, in order.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn list(&self, class: ArtifactClass, name: Option<&str>) -> Result<Vec<ArtifactMeta>> {
        Ok(self
            .state
            .lock()
            .artifacts
            .iter()
            .filter(|artifact| artifact.class == class)
            // the engine's name filter matches prefixes too
            .filter(|artifact| name.map_or(true, |name| artifact.name.starts_with(name)))
            .map(|artifact| ArtifactMeta {
                id: artifact.id.clone(),
                name: artifact.name.clone(),
            })
            .collect())
    }

    async fn create(&self, class: ArtifactClass, name: &str, data: &[u8]) -> Result<String> {
        {
            let state = self.state.lock();

            if state.failing.iter().any(|prefix| name.starts_with(prefix)) {
                return Err(ClusterError::Api {
                    status: 500,
                    message: ErrorMessage {
                        message: "injected failure".to_owned(),
                    },
                });
            }

            if state
                .artifacts
                .iter()
                .any(|artifact| artifact.class == class && artifact.name == name)
            {
                return Err(ClusterError::NameConflict(name.to_owned()));
            }
        }

        let id = self.insert(class, name, data);
        self.state.lock().created.push(name.to_owned());
        Ok(id)
    }

    async fn delete(&self, class: ArtifactClass, id: &str) -> Result<()> {
        let mut state = self.state.lock();

        let Some(pos) = state
            .artifacts
            .iter()
            .position(|artifact| artifact.class == class && artifact.id == id)
        else {
            return Err(ClusterError::NotFound(id.to_owned()));
        };

        if state.pinned.contains(&state.artifacts[pos].name) {
            return Err(ClusterError::Api {
                status: 400,
                message: ErrorMessage {
                    message: format!("{} {id} is in use", class.as_str()),
                },
            });
        }

        state.artifacts.remove(pos);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    services: Vec<Service>,
    updates: usize,
    conflicts: usize,
    lists: usize,
    list_delay: Option<std::time::Duration>,
}

/// In-memory service registry enforcing version indexes.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn add(&self, service: Service) {
        self.state.lock().services.push(service);
    }

    pub fn service(&self, id: &str) -> Service {
        self.state
            .lock()
            .services
            .iter()
            .find(|service| service.id == id)
            .cloned()
            .unwrap()
    }

    /// Count of accepted updates.
    pub fn updates(&self) -> usize {
        self.state.lock().updates
    }

    /// Simulates a concurrent change landing right before the next update.
    pub fn conflict_next_update(&self) {
        self.state.lock().conflicts += 1;
    }

    /// Makes every listing take `delay`.
    pub fn slow_list(&self, delay: std::time::Duration) {
        self.state.lock().list_delay = Some(delay);
    }

    /// Count of service listings, one per pass.
    pub fn lists(&self) -> usize {
        self.state.lock().lists
    }
}

fn has_labels(service: &Service, labels: &[(String, String)]) -> bool {
    let service_labels = service.spec.extra.get("Labels");

    labels.iter().all(|(key, value)| {
        service_labels
            .and_then(|labels| labels.get(key))
            .and_then(|v| v.as_str())
            == Some(value.as_str())
    })
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<Service>> {
        let delay = {
            let mut state = self.state.lock();
            state.lists += 1;
            state.list_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self
            .state
            .lock()
            .services
            .iter()
            .filter(|service| has_labels(service, labels))
            .cloned()
            .collect())
    }

    async fn inspect(&self, service_id: &str) -> Result<Service> {
        self.state
            .lock()
            .services
            .iter()
            .find(|service| service.id == service_id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(service_id.to_owned()))
    }

    async fn update(&self, service_id: &str, version: u64, spec: &ServiceSpec) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let service = state
            .services
            .iter_mut()
            .find(|service| service.id == service_id)
            .ok_or_else(|| ClusterError::NotFound(service_id.to_owned()))?;

        if state.conflicts > 0 {
            state.conflicts -= 1;
            service.version.index += 1;
        }

        if service.version.index != version {
            return Err(ClusterError::VersionConflict {
                service: service_id.to_owned(),
                version,
            });
        }

        service.spec = spec.clone();
        service.version.index += 1;
        state.updates += 1;
        Ok(())
    }
}

#[derive(Debug)]
struct IssuerState {
    not_after: OffsetDateTime,
    failing: HashSet<String>,
    issued: Vec<Vec<String>>,
}

/// Issuer handing out self-signed certificates.
#[derive(Debug)]
pub struct StubIssuer {
    state: Mutex<IssuerState>,
}

impl StubIssuer {
    pub fn new(not_after: OffsetDateTime) -> StubIssuer {
        StubIssuer {
            state: Mutex::new(IssuerState {
                not_after,
                failing: HashSet::new(),
                issued: Vec::new(),
            }),
        }
    }

    /// Expiry of certificates issued from now on.
    pub fn set_not_after(&self, not_after: OffsetDateTime) {
        self.state.lock().not_after = not_after;
    }

    /// Makes issuance fail for any request covering `domain`.
    pub fn fail_for(&self, domain: &str) {
        self.state.lock().failing.insert(domain.to_owned());
    }

    /// Domain lists of successful issuances, in order.
    pub fn issued(&self) -> Vec<Vec<String>> {
        self.state.lock().issued.clone()
    }
}

#[async_trait]
impl CertificateIssuer for StubIssuer {
    async fn obtain(
        &self,
        _account: &AcmeAccount,
        domains: &[String],
    ) -> eyre::Result<Certificate> {
        let not_after = {
            let mut state = self.state.lock();

            if let Some(domain) = domains.iter().find(|d| state.failing.contains(*d)) {
                return Err(eyre!("acme: rate limited for {domain}"));
            }

            state.issued.push(domains.to_vec());
            state.not_after
        };

        let domains = domains.iter().map(String::as_str).collect::<Vec<_>>();
        Ok(self_signed(&domains, not_after))
    }
}

pub struct TestServer {
    pub url: String,
    handle: ServerHandle,
    _dir: Option<tempfile::TempDir>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

fn json_response(status: StatusCode, body: &'static str) -> Response<impl MessageBody> {
    Response::build(status)
        .insert_header(("Content-Type", "application/json"))
        .body(body)
}

fn get_services(query: &str) -> Response<impl MessageBody> {
    const BODY: &str = r#"[
    {
        "ID": "svc1",
        "Version": { "Index": 19 },
        "Spec": {
            "Name": "edge_traefik",
            "Labels": { "edge.traefik.service": "true" },
            "TaskTemplate": {
                "ContainerSpec": {
                    "Image": "traefik:v3.1",
                    "Secrets": [
                        {
                            "File": { "Name": "edge_tls_crt", "UID": "0", "GID": "0", "Mode": 256 },
                            "SecretID": "s1",
                            "SecretName": "edge_tls_crt_202401010000"
                        }
                    ]
                },
                "ForceUpdate": 0
            }
        }
    }
    ]"#;

    if query.contains("edge.traefik.service") {
        json_response(StatusCode::OK, BODY)
    } else {
        json_response(StatusCode::OK, "[]")
    }
}

fn get_service() -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "ID": "svc1",
    "Version": { "Index": 19 },
    "CreatedAt": "2024-01-01T00:00:00.000000000Z",
    "Spec": {
        "Name": "edge_traefik",
        "TaskTemplate": { "ContainerSpec": { "Image": "traefik:v3.1" } }
    }
    }"#;

    json_response(StatusCode::OK, BODY)
}

fn post_service_update(query: &str) -> Response<impl MessageBody> {
    if query == "version=19" {
        json_response(StatusCode::OK, r#"{"Warnings":null}"#)
    } else {
        json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"message":"rpc error: code = Unknown desc = update out of sequence"}"#,
        )
    }
}

fn get_secrets() -> Response<impl MessageBody> {
    const BODY: &str = r#"[
    {
        "ID": "s1",
        "Version": { "Index": 11 },
        "Spec": { "Name": "edge_tls_crt_202401010000", "Labels": {} }
    }
    ]"#;

    json_response(StatusCode::OK, BODY)
}

fn not_found(what: &'static str) -> Response<impl MessageBody> {
    json_response(StatusCode::NOT_FOUND, what)
}

fn route_request(req: Request) -> Response<impl MessageBody> {
    let query = req.uri().query().unwrap_or_default().to_owned();

    match (req.method(), req.path()) {
        (&Method::GET, "/services") => get_services(&query).map_into_boxed_body(),
        (&Method::GET, "/services/svc1") => get_service().map_into_boxed_body(),
        (&Method::POST, "/services/svc1/update") => {
            post_service_update(&query).map_into_boxed_body()
        }

        (&Method::GET, "/secrets") => get_secrets().map_into_boxed_body(),
        (&Method::POST, "/secrets/create") => {
            json_response(StatusCode::CREATED, r#"{"ID":"s2"}"#).map_into_boxed_body()
        }
        (&Method::POST, "/configs/create") => json_response(
            StatusCode::CONFLICT,
            r#"{"message":"rpc error: code = AlreadyExists desc = config exists"}"#,
        )
        .map_into_boxed_body(),
        (&Method::DELETE, "/secrets/s1") => Response::build(StatusCode::NO_CONTENT)
            .finish()
            .map_into_boxed_body(),

        (_, "/services/missing") => {
            not_found(r#"{"message":"service missing not found"}"#).map_into_boxed_body()
        }
        (_, _) => not_found(r#"{"message":"page not found"}"#).map_into_boxed_body(),
    }
}

/// Fake Docker Engine serving a fixed swarm.
pub fn with_engine_server() -> TestServer {
    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("tcp://127.0.0.1:{port}");

    let server = Server::build()
        .listen("engine", lst, move || {
            HttpService::build()
                .finish(|req| ready(Ok::<_, Infallible>(route_request(req))))
                .tcp()
        })
        .unwrap()
        .workers(1)
        .run();

    let handle = server.handle();

    tokio::spawn(server);

    TestServer {
        url,
        handle,
        _dir: None,
    }
}

/// [`with_engine_server`] listening on a unix socket.
#[cfg(unix)]
pub fn with_engine_socket() -> TestServer {
    use actix_http::Protocol;
    use actix_service::{fn_service, ServiceFactoryExt as _};

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("docker.sock");

    let url = format!("unix://{}", socket.display());

    let server = Server::build()
        .bind_uds("engine", &socket, || {
            fn_service(|io: tokio::net::UnixStream| async { Ok((io, Protocol::Http1, None)) })
                .and_then(
                    HttpService::build()
                        .finish(|req| ready(Ok::<_, Infallible>(route_request(req)))),
                )
        })
        .unwrap()
        .workers(1)
        .run();

    let handle = server.handle();

    tokio::spawn(server);

    TestServer {
        url,
        handle,
        _dir: Some(dir),
    }
}

#[tokio::test]
pub async fn test_engine_server() {
    let server = with_engine_server();
    let url = server.url.replace("tcp://", "http://");

    let res = reqwest::get(format!("{url}/secrets")).await.unwrap();
    assert!(res.status().is_success());

    let res = reqwest::get(format!("{url}/nope")).await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
}
