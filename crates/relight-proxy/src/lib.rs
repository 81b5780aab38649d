//! relight-proxy: HTTP front door for scale-to-zero VMs.
//!
//! Two axum routers:
//!
//! | Router | Route | Description |
//! |---|---|---|
//! | [`build_router`] | any | Wake the VM for the `Host` header, then forward |
//! | [`build_ask_router`] | GET `/check?domain=` | Approve on-demand TLS for known hosts |
//!
//! Routing keys are the request host with any port stripped; a VM serves a
//! key when one of its tags (or its hostname) equals it.

pub mod ask;
pub mod host;
pub mod router;

pub use ask::{ASK_LOOKUP_TIMEOUT, build_ask_router};
pub use host::host_key;
pub use router::{ProxyState, RETRY_AFTER_SECS, build_router};
