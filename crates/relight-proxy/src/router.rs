//! Request routing: wakes the VM behind a host and forwards to it.
//!
//! Requests asking for a protocol upgrade (WebSocket and friends) keep their
//! `Connection`/`Upgrade` headers; once the VM answers `101` the two
//! connections are spliced together until either side closes.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use relight_state::VmStateManager;

use crate::host::request_key;

/// `Retry-After` sent with 503 responses while a VM is unavailable.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Shared state for the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    pub state: VmStateManager,
    pub app_port: u16,
    pub wake_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    client: Client<HttpConnector, Body>,
}

impl ProxyState {
    /// In-flight wakes stop waiting once `shutdown` flips to `true`.
    pub fn new(
        state: VmStateManager,
        app_port: u16,
        wake_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            state,
            app_port,
            wake_timeout,
            shutdown,
            client,
        }
    }

    /// Resolves once shutdown has been signalled. Never resolves if the
    /// sender is gone without signalling.
    fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown = self.shutdown.clone();
        async move {
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Build the proxy router. Every path goes through [`proxy`].
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// upstreams see the client address in `x-forwarded-for`.
pub fn build_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy).with_state(state)
}

/// Any method, any path.
pub async fn proxy(State(proxy): State<ProxyState>, mut req: Request) -> Response {
    let Some(key) = request_key(req.headers(), req.uri()).map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "could not determine hostname").into_response();
    };

    let address = match proxy
        .state
        .ensure_running_until(&key, proxy.wake_timeout, proxy.shutdown_signal())
        .await
    {
        Ok(address) => address,
        Err(e) if e.is_not_found() => {
            debug!(%key, "no VM for host");
            return (StatusCode::NOT_FOUND, format!("app for {key} not found")).into_response();
        }
        Err(e) => {
            error!(%key, error = %e, "failed to ensure VM running");
            return unavailable(&key);
        }
    };

    proxy.state.touch_activity(&key);

    let upstream = upstream_authority(&address, proxy.app_port);
    debug!(%key, %upstream, path = req.uri().path(), "proxying request");

    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_upgrade = if upgrade_protocol(req.headers()).is_some() {
        req.extensions_mut().remove::<OnUpgrade>()
    } else {
        None
    };

    let req = match rewrite_request(req, &upstream, client_addr) {
        Ok(req) => req,
        Err(e) => {
            warn!(%key, %upstream, error = %e, "invalid upstream uri");
            return (StatusCode::BAD_GATEWAY, "bad upstream").into_response();
        }
    };

    match proxy.client.request(req).await {
        Ok(mut resp) => {
            if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                let Some(client_upgrade) = client_upgrade else {
                    warn!(%key, %upstream, "upstream switched protocols unasked");
                    return (StatusCode::BAD_GATEWAY, "unexpected upgrade").into_response();
                };
                let upstream_upgrade = hyper::upgrade::on(&mut resp);
                tokio::spawn(tunnel(proxy.state.clone(), key, client_upgrade, upstream_upgrade));
                return resp.map(Body::new);
            }
            let mut resp = resp.map(Body::new);
            strip_hop_by_hop(resp.headers_mut());
            resp
        }
        Err(e) => {
            warn!(%key, %upstream, error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, format!("upstream for {key} unavailable")).into_response()
        }
    }
}

/// Splice an upgraded client connection to the upgraded upstream one.
/// Activity is recorded again on close so a long session is not idle
/// the moment it ends.
async fn tunnel(
    state: VmStateManager,
    key: String,
    client: OnUpgrade,
    upstream: OnUpgrade,
) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%key, error = %e, "upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(%key, sent, received, "upgraded connection closed"),
        Err(e) => debug!(%key, error = %e, "upgraded connection aborted"),
    }
    state.touch_activity(&key);
}

fn unavailable(key: &str) -> Response {
    let mut resp = (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("app for {key} is starting up, please retry"),
    )
        .into_response();
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    resp
}

fn upstream_authority(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// The requested protocol, when the request asks to upgrade the connection.
fn upgrade_protocol(headers: &axum::http::HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Point the request at `upstream`, keeping method, path, query, headers
/// and body. The client address is appended to `x-forwarded-for`.
fn rewrite_request(
    mut req: Request,
    upstream: &str,
    client: Option<SocketAddr>,
) -> Result<Request, axum::http::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = Uri::builder()
        .scheme("http")
        .authority(upstream)
        .path_and_query(path_and_query)
        .build()?;
    *req.uri_mut() = uri;

    let headers = req.headers_mut();
    let upgrade = upgrade_protocol(headers);
    strip_hop_by_hop(headers);
    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(client) = client {
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {}", client.ip()),
            None => client.ip().to_string(),
        };
        headers.insert(X_FORWARDED_FOR, HeaderValue::try_from(forwarded_for)?);
    }
    Ok(req)
}

fn strip_hop_by_hop(headers: &mut axum::http::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_brackets_ipv6() {
        assert_eq!(upstream_authority("10.0.0.5", 8080), "10.0.0.5:8080");
        assert_eq!(upstream_authority("fd00::5", 8080), "[fd00::5]:8080");
        assert_eq!(upstream_authority("[fd00::5]", 80), "[fd00::5]:80");
    }

    #[test]
    fn rewrite_keeps_path_and_query() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/items?page=2")
            .header(header::HOST, "alpha.local")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();

        let req = rewrite_request(req, "10.0.0.5:8080", None).unwrap();
        assert_eq!(req.method(), "POST");
        assert_eq!(req.uri().to_string(), "http://10.0.0.5:8080/api/items?page=2");
        assert_eq!(req.headers()[header::HOST], "alpha.local");
        assert_eq!(req.headers()["x-forwarded-host"], "alpha.local");
        assert!(req.headers().get(header::CONNECTION).is_none());
        assert!(req.headers().get("x-forwarded-for").is_none());
    }

    #[test]
    fn rewrite_appends_client_to_forwarded_for() {
        let client: SocketAddr = "192.0.2.7:50412".parse().unwrap();

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "alpha.local")
            .body(Body::empty())
            .unwrap();
        let req = rewrite_request(req, "10.0.0.5:8080", Some(client)).unwrap();
        assert_eq!(req.headers()["x-forwarded-for"], "192.0.2.7");

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "alpha.local")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        let req = rewrite_request(req, "10.0.0.5:8080", Some(client)).unwrap();
        assert_eq!(req.headers()["x-forwarded-for"], "203.0.113.9, 192.0.2.7");
    }

    #[test]
    fn rewrite_keeps_upgrade_headers() {
        let req = Request::builder()
            .uri("/ws")
            .header(header::HOST, "alpha.local")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::TE, "trailers")
            .body(Body::empty())
            .unwrap();

        let req = rewrite_request(req, "10.0.0.5:8080", None).unwrap();
        assert_eq!(req.headers()[header::CONNECTION], "upgrade");
        assert_eq!(req.headers()[header::UPGRADE], "websocket");
        assert!(req.headers().get(header::TE).is_none());
    }

    #[test]
    fn upgrade_needs_connection_token() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert_eq!(upgrade_protocol(&headers), None);

        headers.insert(header::CONNECTION, HeaderValue::from_static("UPGRADE"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");
    }

    #[test]
    fn unavailable_sets_retry_after() {
        let resp = unavailable("alpha");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "5");
    }
}
