//! relight-core: configuration for the relight scale-to-zero router.
//!
//! Parses `relight.toml`, applies defaults and validates the result. The
//! routing core consumes plain [`std::time::Duration`] values; everything
//! string-shaped stops here.

pub mod config;
pub mod duration;

pub use config::{
    ConfigError, ControlPlaneConfig, ControlPlaneEndpoint, RelightConfig, RoutingConfig,
    ServerConfig,
};
pub use duration::parse_duration;
