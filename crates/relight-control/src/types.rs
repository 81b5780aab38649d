//! Wire types shared by every control plane implementation.

use serde::{Deserialize, Serialize};

/// A VM as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Control plane handle, used for resume/pause.
    pub hostname: String,
    /// Network address of the VM.
    #[serde(rename = "ip")]
    pub address: String,
    /// Provider status string ("Running", "Paused", ...).
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Provider status folded into what the router cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Running,
    Paused,
    Other,
}

impl RemoteStatus {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("running") {
            Self::Running
        } else if s.eq_ignore_ascii_case("paused") {
            Self::Paused
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Other => "Unknown",
        }
    }
}

impl NodeInfo {
    pub fn new(hostname: &str, address: &str, status: RemoteStatus) -> Self {
        Self {
            hostname: hostname.to_string(),
            address: address.to_string(),
            status: status.as_str().to_string(),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn remote_status(&self) -> RemoteStatus {
        RemoteStatus::parse(&self.status)
    }

    /// Whether this VM serves `key`.
    pub fn matches(&self, key: &str) -> bool {
        self.hostname == key || self.tags.iter().any(|t| t == key)
    }
}
