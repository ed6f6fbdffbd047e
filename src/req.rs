use std::{io, time::Duration};

use reqwest::{header::CONTENT_TYPE, Method, Url};

use crate::{api::ErrorMessage, error::*};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn req_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Status and body of an engine response.
#[derive(Debug)]
pub(crate) struct EngineResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
}

impl EngineResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// How requests reach the engine.
#[derive(Debug, Clone)]
pub(crate) enum Transport {
    /// Plain HTTP or HTTPS to `base_url`.
    Http {
        client: reqwest::Client,
        base_url: String,
    },

    /// HTTP/1.1 over a local socket, one connection per request.
    #[cfg(unix)]
    Unix { socket: std::path::PathBuf },
}

impl Transport {
    pub(crate) fn http(base_url: String) -> reqwest::Result<Transport> {
        Ok(Transport::Http {
            client: req_client()?,
            base_url,
        })
    }

    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<EngineResponse> {
        let target = path_and_query(path, query);
        log::trace!("{method} {target}");

        match self {
            Transport::Http { client, base_url } => {
                let mut req = client.request(method, format!("{base_url}{target}"));

                if let Some(body) = body {
                    req = req.header(CONTENT_TYPE, "application/json").body(body);
                }

                let res = req.send().await?;
                let status = res.status().as_u16();

                Ok(EngineResponse {
                    status,
                    body: req_safe_read_body(res).await,
                })
            }

            #[cfg(unix)]
            Transport::Unix { socket } => {
                tokio::time::timeout(REQUEST_TIMEOUT, send_unix(socket, method, &target, body))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "engine request timed out")
                    })?
            }
        }
    }
}

#[cfg(unix)]
async fn send_unix(
    socket: &std::path::Path,
    method: Method,
    target: &str,
    body: Option<Vec<u8>>,
) -> Result<EngineResponse> {
    use http_body_util::{BodyExt as _, Full};
    use hyper::{body::Bytes, header::HOST};
    use hyper_util::rt::TokioIo;

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::UnixStream::connect(socket))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "engine socket connect timed out"))?
        .map_err(|err| io::Error::new(err.kind(), format!("{}: {err}", socket.display())))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            log::debug!("engine connection closed: {err}");
        }
    });

    let mut req = hyper::Request::builder()
        .method(method)
        .uri(target)
        // the engine ignores it, HTTP/1.1 requires it
        .header(HOST, "docker");

    if body.is_some() {
        req = req.header(CONTENT_TYPE, "application/json");
    }

    let req = req
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let res = sender.send_request(req).await?;
    let status = res.status().as_u16();

    // a connection dropped mid-body still leaves us with the status to report
    let body = match res.into_body().collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(err) => {
            log::debug!("reading engine response: {err}");
            String::new()
        }
    };

    Ok(EngineResponse { status, body })
}

/// Renders `path` with its url-encoded query string.
fn path_and_query(path: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return path.to_owned();
    }

    // only used for its encoder, the host never leaves this function
    let mut url = match Url::parse("http://engine") {
        Ok(url) => url,
        Err(_) => return path.to_owned(),
    };
    url.set_path(path);
    url.query_pairs_mut()
        .extend_pairs(query.iter().map(|(key, value)| (*key, value.as_str())));

    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_owned(),
    }
}

pub(crate) fn req_handle_error(res: EngineResponse) -> Result<EngineResponse> {
    // ok responses pass through
    if res.is_success() {
        return Ok(res);
    }

    // the engine answers errors with {"message": "..."}, anything else is kept verbatim
    let message =
        serde_json::from_str::<ErrorMessage>(&res.body).unwrap_or_else(|_| ErrorMessage {
            message: format!("{} body: {}", res.status, res.body),
        });

    Err(ClusterError::Api {
        status: res.status,
        message,
    })
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // a connection dropped mid-body still leaves us with the status to report
    res.text().await.unwrap_or_default()
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(res: &EngineResponse) -> Result<T> {
    log::trace!("{}", res.body);
    Ok(serde_json::from_str(&res.body)?)
}
