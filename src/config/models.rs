//! Configuration data structures for Hermes.
//!
//! [`GatewayConfig`] maps the `HERMES_`-prefixed environment surface;
//! [`RoutesFile`] maps the local YAML route file. Both are serde-friendly
//! with defaults so a minimal deployment needs no configuration at all.

use serde::{Deserialize, Serialize};

/// Load balancing strategy for service targets.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    Random,
    LeastConn,
}

/// Gateway process configuration, loaded from `HERMES_*` environment
/// variables.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// Whether to poll the service registry for routes and instances.
    pub registry_enabled: bool,
    pub registry_url: String,
    /// Seconds between registry refreshes.
    pub registry_poll_interval: u64,
    /// Per-request timeout against the registry, in seconds.
    pub registry_timeout: u64,
    /// How long startup may block on the first refresh before proceeding
    /// with local-only routing, in seconds.
    pub registry_bootstrap_timeout: u64,
    /// Identifier sent as `X-Gateway-ID` on registry calls.
    pub gateway_id: String,

    /// Total wall-clock budget per proxied request, in seconds.
    pub proxy_timeout: u64,
    pub proxy_max_retries: u32,
    /// Request bodies at or below this many bytes (with a known length) are
    /// buffered so retries can replay them; larger or unsized bodies stream.
    pub proxy_stream_threshold: u64,

    pub load_balance_strategy: LoadBalanceStrategy,

    pub rate_limit_enabled: bool,
    pub rate_limit_global_qps: f64,
    pub rate_limit_per_route_qps: f64,
    pub rate_limit_per_ip_qps: f64,
    /// Maximum tracked client IPs; the least recently used entry is evicted
    /// on insert when full.
    pub rate_limit_ip_map_capacity: usize,
    pub rate_limit_burst_multiplier: f64,

    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds an open circuit waits before admitting a half-open probe.
    pub circuit_breaker_timeout: u64,

    pub local_routes_file: String,
    /// Added to every local route's priority so local rules outrank remote
    /// ones declared at the same level.
    pub local_routes_priority_boost: i32,
    /// When the registry is unreachable, serve local routes only instead of
    /// retaining the previous merged table.
    pub fallback_to_local: bool,

    pub auth_plugin_enabled: bool,
    /// When the auth service is unreachable: true lets requests through as
    /// if authenticated, false fails them with 503.
    pub auth_degrade_allow: bool,

    pub log_level: String,
    pub log_json: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8880,
            registry_enabled: true,
            registry_url: "http://localhost:8888".to_string(),
            registry_poll_interval: 30,
            registry_timeout: 10,
            registry_bootstrap_timeout: 5,
            gateway_id: "hermes".to_string(),
            proxy_timeout: 30,
            proxy_max_retries: 3,
            proxy_stream_threshold: 1024 * 1024,
            load_balance_strategy: LoadBalanceStrategy::RoundRobin,
            rate_limit_enabled: true,
            rate_limit_global_qps: 10_000.0,
            rate_limit_per_route_qps: 1_000.0,
            rate_limit_per_ip_qps: 100.0,
            rate_limit_ip_map_capacity: 10_000,
            rate_limit_burst_multiplier: 1.5,
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout: 30,
            local_routes_file: "routes.yaml".to_string(),
            local_routes_priority_boost: 1000,
            fallback_to_local: true,
            auth_plugin_enabled: true,
            auth_degrade_allow: false,
            log_level: "info".to_string(),
            log_json: true,
        }
    }
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Methods field of a route entry: `"*"`, a comma-separated string, or a
/// list of method names.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum MethodsEntry {
    Wildcard(String),
    List(Vec<String>),
}

impl Default for MethodsEntry {
    fn default() -> Self {
        Self::Wildcard("*".to_string())
    }
}

/// Authentication block of a route entry.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuthConfigEntry {
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub auth_service_id: Option<String>,
    #[serde(default)]
    pub public_paths: Vec<String>,
    #[serde(default)]
    pub login_redirect: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One route rule as written in the local YAML file (and, with a
/// `route_id`, as returned by the registry).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteEntry {
    pub path_pattern: String,
    #[serde(default)]
    pub methods: MethodsEntry,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub target_service_id: Option<String>,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub strip_path: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub retry_non_idempotent: bool,
    #[serde(default)]
    pub auth_config: Option<AuthConfigEntry>,
}

impl Default for RouteEntry {
    fn default() -> Self {
        Self {
            path_pattern: String::new(),
            methods: MethodsEntry::default(),
            target_url: None,
            target_service_id: None,
            strip_prefix: false,
            strip_path: None,
            priority: 0,
            enabled: true,
            retry_non_idempotent: false,
            auth_config: None,
        }
    }
}

/// The local route file (`routes.yaml`).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RoutesFile {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    /// Applied to entries that carry no `auth_config` of their own.
    #[serde(default)]
    pub default_auth_config: Option<AuthConfigEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_entry_accepts_all_three_forms() {
        let wildcard: MethodsEntry = serde_json::from_str("\"*\"").unwrap();
        assert!(matches!(wildcard, MethodsEntry::Wildcard(s) if s == "*"));

        let csv: MethodsEntry = serde_json::from_str("\"GET,POST\"").unwrap();
        assert!(matches!(csv, MethodsEntry::Wildcard(_)));

        let list: MethodsEntry = serde_json::from_str("[\"GET\", \"POST\"]").unwrap();
        assert!(matches!(list, MethodsEntry::List(v) if v.len() == 2));
    }

    #[test]
    fn route_entry_defaults_are_permissive() {
        let entry: RouteEntry =
            serde_json::from_str(r#"{"path_pattern": "/api/**", "target_url": "http://b"}"#)
                .unwrap();
        assert!(entry.enabled);
        assert!(!entry.strip_prefix);
        assert_eq!(entry.priority, 0);
        assert!(entry.auth_config.is_none());
    }

    #[test]
    fn gateway_config_defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:8880");
        assert_eq!(config.proxy_max_retries, 3);
        assert_eq!(config.rate_limit_ip_map_capacity, 10_000);
        assert_eq!(config.local_routes_priority_boost, 1000);
        assert!(!config.auth_degrade_allow);
    }

    #[test]
    fn routes_file_round_trips_through_serde() {
        let entry = RouteEntry {
            path_pattern: "/api/**".to_string(),
            target_service_id: Some("users".to_string()),
            priority: 10,
            auth_config: Some(AuthConfigEntry {
                require_auth: true,
                public_paths: vec!["/api/docs/**".to_string()],
                ..AuthConfigEntry::default()
            }),
            ..RouteEntry::default()
        };
        let file = RoutesFile {
            routes: vec![entry],
            default_auth_config: None,
        };

        let json = serde_json::to_string(&file).unwrap();
        let back: RoutesFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.routes.len(), 1);
        let r = &back.routes[0];
        assert_eq!(r.path_pattern, "/api/**");
        assert_eq!(r.target_service_id.as_deref(), Some("users"));
        assert_eq!(r.priority, 10);
        assert!(r.auth_config.as_ref().unwrap().require_auth);
    }
}
