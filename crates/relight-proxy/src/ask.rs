//! On-demand TLS "ask" endpoint.
//!
//! A TLS terminator asks `GET /check?domain=<d>` before issuing a
//! certificate; only hosts that map to a VM are approved.

use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tracing::{debug, error, info};

use relight_state::{LifecycleState, VmStateManager};

/// Upper bound on a single ask lookup.
pub const ASK_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct AskParams {
    #[serde(default)]
    pub domain: Option<String>,
}

/// Build the ask router.
pub fn build_ask_router(state: VmStateManager) -> Router {
    Router::new()
        .route("/check", get(check_domain))
        .with_state(state)
}

/// GET /check?domain=
pub async fn check_domain(
    State(state): State<VmStateManager>,
    Query(params): Query<AskParams>,
) -> Response {
    let Some(domain) = params.domain.filter(|d| !d.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing domain parameter").into_response();
    };

    let record = match tokio::time::timeout(ASK_LOOKUP_TIMEOUT, state.lookup(&domain)).await {
        Ok(Ok(record)) => record,
        Ok(Err(e)) => {
            error!(%domain, error = %e, "ask lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
        Err(_) => {
            error!(%domain, timeout = ?ASK_LOOKUP_TIMEOUT, "ask lookup timed out");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
    };

    if record.state == LifecycleState::NotFound {
        debug!(%domain, "ask: domain not found");
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    info!(%domain, "ask: domain approved");
    (StatusCode::OK, "ok\n").into_response()
}
