//! HTTP client for the Slicer control plane API.
//!
//! One HTTP/1.1 connection per call, dialled over TCP, TLS or a Unix socket
//! depending on the configured endpoint. Every request carries the bearer
//! token and is bounded by a per-call timeout.
//!
//! | Operation | Request |
//! |---|---|
//! | describe | `GET {base}/hostgroup/{group}/nodes` |
//! | resume | `POST {base}/vm/{hostname}/resume` |
//! | pause | `POST {base}/vm/{hostname}/pause` |

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use relight_core::ControlPlaneEndpoint;

use crate::error::{ControlError, ControlResult};
use crate::types::NodeInfo;
use crate::{BoxFuture, ControlPlane};

/// Per-call deadline used unless overridden.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("relight/", env!("CARGO_PKG_VERSION"));

/// Control plane client speaking the Slicer REST API.
#[derive(Debug, Clone)]
pub struct SlicerClient {
    endpoint: ControlPlaneEndpoint,
    token: String,
    host_group: String,
    timeout: Duration,
    /// Overrides the Mozilla root store for `https://` endpoints.
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl SlicerClient {
    pub fn new(endpoint: ControlPlaneEndpoint, token: &str, host_group: &str) -> Self {
        Self {
            endpoint,
            token: token.to_string(),
            host_group: host_group.to_string(),
            timeout: DEFAULT_CALL_TIMEOUT,
            tls_config: None,
        }
    }

    /// Builder method: use a custom TLS configuration, e.g. a private CA.
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Builder method: set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host_group(&self) -> &str {
        &self.host_group
    }

    /// List every node in the configured host group.
    pub async fn list_nodes(&self) -> ControlResult<Vec<NodeInfo>> {
        let path = format!("/hostgroup/{}/nodes", self.host_group);
        let body = self.call(Method::GET, &path).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn call(&self, method: Method, path: &str) -> ControlResult<Bytes> {
        let (status, body) = tokio::time::timeout(self.timeout, self.send(method.clone(), path))
            .await
            .map_err(|_| ControlError::Timeout(self.timeout))??;

        debug!(%method, path, status = status.as_u16(), "control plane call");

        if !status.is_success() {
            return Err(ControlError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn send(&self, method: Method, path: &str) -> ControlResult<(StatusCode, Bytes)> {
        let (uri, host) = match &self.endpoint {
            ControlPlaneEndpoint::Http {
                authority,
                base_path,
                ..
            }
            | ControlPlaneEndpoint::Https {
                authority,
                base_path,
                ..
            } => (format!("{base_path}{path}"), authority.as_str()),
            ControlPlaneEndpoint::Unix { .. } => (path.to_string(), "localhost"),
        };

        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::HOST, host)
            .header(http::header::USER_AGENT, USER_AGENT)
            .header(http::header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(http::header::ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))?;

        match &self.endpoint {
            ControlPlaneEndpoint::Http { connect_addr, .. } => {
                let stream = tokio::net::TcpStream::connect(connect_addr)
                    .await
                    .map_err(ControlError::Connect)?;
                round_trip(TokioIo::new(stream), req).await
            }
            ControlPlaneEndpoint::Https {
                connect_addr,
                server_name,
                ..
            } => {
                let name = ServerName::try_from(server_name.clone())
                    .map_err(|_| ControlError::ServerName(server_name.clone()))?;
                let connector = TlsConnector::from(self.tls_config()?);
                let stream = tokio::net::TcpStream::connect(connect_addr)
                    .await
                    .map_err(ControlError::Connect)?;
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(ControlError::Handshake)?;
                round_trip(TokioIo::new(stream), req).await
            }
            ControlPlaneEndpoint::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(ControlError::Connect)?;
                round_trip(TokioIo::new(stream), req).await
            }
        }
    }
}

impl SlicerClient {
    fn tls_config(&self) -> ControlResult<Arc<rustls::ClientConfig>> {
        match &self.tls_config {
            Some(config) => Ok(Arc::clone(config)),
            None => default_tls_config(),
        }
    }
}

/// Client config trusting the Mozilla root store, built once.
fn default_tls_config() -> ControlResult<Arc<rustls::ClientConfig>> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::clone(CONFIG.get_or_init(|| Arc::new(config))))
}

/// Send one request over a fresh connection and collect the response.
async fn round_trip<I>(io: I, req: Request<Full<Bytes>>) -> ControlResult<(StatusCode, Bytes)>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

impl ControlPlane for SlicerClient {
    fn describe<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ControlResult<Vec<NodeInfo>>> {
        Box::pin(async move {
            let nodes = self.list_nodes().await?;
            Ok(nodes.into_iter().filter(|n| n.matches(key)).collect())
        })
    }

    fn resume<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>> {
        Box::pin(async move {
            self.call(Method::POST, &format!("/vm/{hostname}/resume"))
                .await
                .map(|_| ())
        })
    }

    fn pause<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>> {
        Box::pin(async move {
            self.call(Method::POST, &format!("/vm/{hostname}/pause"))
                .await
                .map(|_| ())
        })
    }
}
