//! relight-control: the control plane seen from the router.
//!
//! The routing core only needs three operations from the VM control plane:
//! describe the VMs behind a key, resume one, pause one. They are captured
//! by the [`ControlPlane`] trait.
//!
//! # Implementations
//!
//! - **[`SlicerClient`]**: HTTP/1.1 over TCP, TLS or a Unix socket
//! - **`MemoryControlPlane`**: in-memory VMs with call counters and
//!   injectable latency/failures, for tests (feature `test-util`)

pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use client::SlicerClient;
pub use error::{ControlError, ControlResult};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryControlPlane;
pub use types::{NodeInfo, RemoteStatus};

/// Boxed future returned by [`ControlPlane`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations the router needs from the VM control plane.
///
/// Every call may be slow and may fail; callers must not hold locks
/// across them.
pub trait ControlPlane: Send + Sync + 'static {
    /// List the VMs that serve `key` (matched by tag or hostname).
    fn describe<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ControlResult<Vec<NodeInfo>>>;

    /// Resume a paused VM. Returning `Ok` means the VM is addressable.
    fn resume<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>>;

    /// Pause a running VM.
    fn pause<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>>;
}
