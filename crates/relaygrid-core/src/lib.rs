//! Shared building blocks for the relaygrid registry and gateway.
//!
//! - **`config`**: TOML configuration model, loader and validation
//! - **`types`**: service instances and the `InstanceSource` seam
//! - **`clock`**: injectable monotonic time for leases and breakers

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BreakerOverride, BreakerParams, CircuitBreakerSettings, ConfigError, CorsSettings, GatewayConfig, GatewaySettings,
    LoadBalancerPolicy, RateLimitSettings, RegistrySettings, RouteConfig, ServerConfig,
};
pub use types::*;
