//! Gateway and registry configuration (TOML).
//!
//! Loaded once at startup and immutable afterwards. Anything malformed
//! is reported as a `ConfigError` and aborts startup.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration shared by every `relayd` mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub registry: RegistrySettings,
    pub gateway: GatewaySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub gateway_listen: SocketAddr,
    pub registry_listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gateway_listen: SocketAddr::from(([0, 0, 0, 0], 8072)),
            registry_listen: SocketAddr::from(([0, 0, 0, 0], 8070)),
        }
    }
}

/// Lease timing for the registry and its clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySettings {
    /// How often instances are told to heartbeat.
    #[serde(with = "duration_str")]
    pub renewal_interval: Duration,
    /// Silence after which an instance stops being `Up`.
    #[serde(with = "duration_str")]
    pub lease_duration: Duration,
    /// Extra silence tolerated in `Expiring` before eviction.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Refresh interval of a gateway's remote directory cache.
    #[serde(with = "duration_str")]
    pub fetch_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            renewal_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            fetch_interval: Duration::from_secs(30),
        }
    }
}

impl RegistrySettings {
    /// Silence after which the sweep deletes an instance.
    pub fn eviction_threshold(&self) -> Duration {
        self.lease_duration + self.grace_period
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerPolicy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySettings {
    /// Deadline for a single forwarded exchange.
    #[serde(with = "duration_str")]
    pub forward_timeout: Duration,
    /// Extra attempts against other instances after a failed one.
    pub max_retries: u32,
    pub load_balancer: LoadBalancerPolicy,
    pub max_body_bytes: usize,
    /// Cap on a buffered backend response body.
    pub max_response_bytes: usize,
    pub rate_limit: Option<RateLimitSettings>,
    pub cors: Option<CorsSettings>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(2),
            max_retries: 1,
            load_balancer: LoadBalancerPolicy::RoundRobin,
            max_body_bytes: 1024 * 1024,
            max_response_bytes: 10 * 1024 * 1024,
            rate_limit: None,
            cors: None,
        }
    }
}

/// Per-client token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    pub requests_per_second: u32,
    #[serde(default)]
    pub burst: Option<u32>,
}

/// Cross-origin policy applied to every gateway response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsSettings {
    /// Exact origins, or `"*"` for any.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    /// How long browsers may cache a preflight answer.
    #[serde(with = "duration_str")]
    pub max_age: Duration,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: ["content-type", "authorization", "x-correlation-id"]
                .map(String::from)
                .to_vec(),
            max_age: Duration::from_secs(3600),
        }
    }
}

impl CorsSettings {
    /// True when any origin is allowed.
    pub fn any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_origins.is_empty() {
            return Err(invalid("gateway.cors.allowed_origins is empty".to_string()));
        }
        for origin in self.allowed_origins.iter().filter(|o| *o != "*") {
            if http::HeaderValue::from_str(origin).is_err() {
                return Err(invalid(format!("gateway.cors: invalid origin `{origin}`")));
            }
        }
        for method in &self.allowed_methods {
            if http::Method::from_bytes(method.as_bytes()).is_err() {
                return Err(invalid(format!("gateway.cors: invalid method `{method}`")));
            }
        }
        for name in &self.allowed_headers {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(invalid(format!("gateway.cors: invalid header `{name}`")));
            }
        }
        Ok(())
    }
}

/// Circuit breaker parameters for one target service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerParams {
    pub window_size: usize,
    /// Failure percentage (0, 100] that opens a full window.
    pub failure_rate_threshold: f64,
    #[serde(with = "duration_str")]
    pub wait_duration: Duration,
    pub half_open_probes: u32,
    /// Backend statuses treated as failed attempts.
    pub failure_status_codes: Vec<u16>,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 50.0,
            wait_duration: Duration::from_secs(10),
            half_open_probes: 3,
            failure_status_codes: Vec::new(),
        }
    }
}

impl BreakerParams {
    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(invalid(format!("{scope}: window_size must be at least 1")));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(invalid(format!(
                "{scope}: failure_rate_threshold must be in (0, 100], got {}",
                self.failure_rate_threshold
            )));
        }
        if self.half_open_probes == 0 {
            return Err(invalid(format!("{scope}: half_open_probes must be at least 1")));
        }
        if let Some(code) = self
            .failure_status_codes
            .iter()
            .find(|c| !(100..=599).contains(*c))
        {
            return Err(invalid(format!("{scope}: invalid status code {code}")));
        }
        Ok(())
    }
}

/// Per-service overrides; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerOverride {
    pub window_size: Option<usize>,
    pub failure_rate_threshold: Option<f64>,
    #[serde(with = "duration_str::option")]
    pub wait_duration: Option<Duration>,
    pub half_open_probes: Option<u32>,
    pub failure_status_codes: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    #[serde(flatten)]
    pub defaults: BreakerParams,
    pub services: HashMap<String, BreakerOverride>,
}

impl CircuitBreakerSettings {
    /// Effective parameters for `service`.
    pub fn for_service(&self, service: &str) -> BreakerParams {
        let mut params = self.defaults.clone();
        if let Some(o) = self.services.get(service) {
            if let Some(v) = o.window_size {
                params.window_size = v;
            }
            if let Some(v) = o.failure_rate_threshold {
                params.failure_rate_threshold = v;
            }
            if let Some(v) = o.wait_duration {
                params.wait_duration = v;
            }
            if let Some(v) = o.half_open_probes {
                params.half_open_probes = v;
            }
            if let Some(v) = &o.failure_status_codes {
                params.failure_status_codes = v.clone();
            }
        }
        params
    }
}

/// One entry of the static route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Path prefix, optionally ending in `/**` or `/*`.
    pub path: String,
    /// Logical service name resolved through the directory.
    pub service: String,
    /// Leading path segments removed before forwarding.
    #[serde(default)]
    pub strip_prefix: usize,
}

impl GatewayConfig {
    /// Read, parse and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.registry;
        for (name, value) in [
            ("renewal_interval", r.renewal_interval),
            ("lease_duration", r.lease_duration),
            ("sweep_interval", r.sweep_interval),
            ("fetch_interval", r.fetch_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("registry.{name} must be non-zero")));
            }
        }
        if r.lease_duration <= r.renewal_interval {
            return Err(invalid(format!(
                "registry.lease_duration ({:?}) must exceed renewal_interval ({:?})",
                r.lease_duration, r.renewal_interval
            )));
        }

        if self.gateway.forward_timeout.is_zero() {
            return Err(invalid("gateway.forward_timeout must be non-zero".to_string()));
        }
        if let Some(rl) = &self.gateway.rate_limit {
            if rl.requests_per_second == 0 || rl.burst == Some(0) {
                return Err(invalid(
                    "gateway.rate_limit values must be at least 1".to_string(),
                ));
            }
        }

        if let Some(cors) = &self.gateway.cors {
            cors.validate()?;
        }

        self.circuit_breaker.defaults.validate("circuit_breaker")?;
        for service in self.circuit_breaker.services.keys() {
            self.circuit_breaker
                .for_service(service)
                .validate(&format!("circuit_breaker.services.{service}"))?;
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(invalid(format!(
                    "route path `{}` must start with '/'",
                    route.path
                )));
            }
            if route.service.trim().is_empty() {
                return Err(invalid(format!("route `{}` has no service", route.path)));
            }
            if !seen.insert(route.path.as_str()) {
                return Err(invalid(format!("duplicate route path `{}`", route.path)));
            }
        }

        Ok(())
    }

    /// Distinct target services named by the route table.
    pub fn routed_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.routes.iter().map(|r| r.service.clone()).collect();
        services.sort();
        services.dedup();
        services
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}

/// Parse a duration string like "5s", "500ms", "2m", "1h" or "10".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let m = mins.trim().parse::<u64>().ok()?;
        m.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let h = hours.trim().parse::<u64>().ok()?;
        h.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the same notation `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"500ms\", \"5s\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).ok_or_else(|| E::custom(format!("invalid duration `{v}`")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration {v}")))
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] Duration);

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<Wrapped>::deserialize(d)?.map(|Wrapped(v)| v))
        }
    }
}
