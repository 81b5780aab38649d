//! Control plane error types.

use std::time::Duration;

use thiserror::Error;

/// Errors from a control plane call.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("connect to control plane: {0}")]
    Connect(#[source] std::io::Error),

    #[error("tls setup: {0}")]
    Tls(#[from] rustls::Error),

    #[error("tls handshake with control plane: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("invalid tls server name {0:?}")]
    ServerName(String),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("control plane call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Remote(String),
}

pub type ControlResult<T> = Result<T, ControlError>;
