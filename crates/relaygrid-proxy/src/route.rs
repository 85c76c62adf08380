//! Static route table mapping request paths to logical services.
//!
//! Patterns are path prefixes, optionally ending in `/**` or `/*`.
//! Matching respects segment boundaries and the longest prefix wins.

use serde::Serialize;
use tracing::debug;

use relaygrid_core::RouteConfig;

use crate::error::{ProxyError, ProxyResult};

/// A compiled route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Pattern as written in the configuration.
    pub pattern: String,
    /// Target service resolved through the directory.
    pub service: String,
    /// Leading path segments dropped before forwarding.
    pub strip_prefix: usize,
    #[serde(skip)]
    prefix: String,
}

impl Route {
    pub fn new(config: &RouteConfig) -> Self {
        Self {
            pattern: config.path.clone(),
            service: config.service.clone(),
            strip_prefix: config.strip_prefix,
            prefix: normalize_prefix(&config.path),
        }
    }

    /// The literal prefix this route matches on.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path to send upstream after stripping `strip_prefix` segments.
    pub fn rewrite_path(&self, path: &str) -> String {
        if self.strip_prefix == 0 {
            return path.to_string();
        }
        let rest: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(self.strip_prefix)
            .collect();
        let mut rewritten = format!("/{}", rest.join("/"));
        if path.ends_with('/') && !rest.is_empty() {
            rewritten.push('/');
        }
        rewritten
    }
}

/// Immutable, longest-prefix-first list of routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = configs.iter().map(Route::new).collect();
        // Stable sort keeps configuration order among equal prefixes.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        debug!(count = routes.len(), "route table built");
        Self { routes }
    }

    /// Find the route for `path`; the longest matching prefix wins.
    pub fn match_route(&self, path: &str) -> ProxyResult<&Route> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .ok_or_else(|| ProxyError::NoMatch(path.to_string()))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn normalize_prefix(pattern: &str) -> String {
    let trimmed = pattern
        .strip_suffix("/**")
        .or_else(|| pattern.strip_suffix("/*"))
        .unwrap_or(pattern);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, service: &str) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            service: service.to_string(),
            strip_prefix: 0,
        }
    }

    #[test]
    fn glob_pattern_matches_prefix_and_descendants() {
        let table = RouteTable::new(&[route("/api/v1/accounts/**", "accounts-service")]);

        for path in ["/api/v1/accounts", "/api/v1/accounts/", "/api/v1/accounts/42/cards"] {
            assert_eq!(table.match_route(path).unwrap().service, "accounts-service");
        }
    }

    #[test]
    fn matching_respects_segment_boundaries() {
        let table = RouteTable::new(&[route("/api/v1/accounts/**", "accounts-service")]);
        assert_eq!(
            table.match_route("/api/v1/accountsx"),
            Err(ProxyError::NoMatch("/api/v1/accountsx".to_string()))
        );
        assert!(table.match_route("/api/v1").is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new(&[
            route("/api/**", "edge-service"),
            route("/api/v1/accounts/**", "accounts-service"),
            route("/api/v1/**", "v1-service"),
        ]);

        assert_eq!(table.match_route("/api/v1/accounts/7").unwrap().service, "accounts-service");
        assert_eq!(table.match_route("/api/v1/cards").unwrap().service, "v1-service");
        assert_eq!(table.match_route("/api/v2").unwrap().service, "edge-service");
    }

    #[test]
    fn root_pattern_matches_everything() {
        let table = RouteTable::new(&[route("/**", "catch-all"), route("/api", "api")]);
        assert_eq!(table.match_route("/anything/else").unwrap().service, "catch-all");
        assert_eq!(table.match_route("/api/x").unwrap().service, "api");
    }

    #[test]
    fn empty_table_matches_nothing() {
        let table = RouteTable::new(&[]);
        assert!(table.is_empty());
        assert!(matches!(table.match_route("/"), Err(ProxyError::NoMatch(_))));
    }

    #[test]
    fn strip_prefix_drops_leading_segments() {
        let mut config = route("/accounts-api/**", "accounts-service");
        config.strip_prefix = 1;
        let r = Route::new(&config);

        assert_eq!(r.rewrite_path("/accounts-api/api/fetch"), "/api/fetch");
        assert_eq!(r.rewrite_path("/accounts-api"), "/");
        assert_eq!(r.rewrite_path("/accounts-api/api/"), "/api/");
    }

    #[test]
    fn zero_strip_prefix_keeps_path() {
        let r = Route::new(&route("/api/**", "svc"));
        assert_eq!(r.rewrite_path("/api/v1/x"), "/api/v1/x");
    }
}
