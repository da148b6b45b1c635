//! The request context and the ordered plugin chain.
//!
//! Plugins run `before` in ascending priority and `after` in descending
//! priority over exactly the plugins whose `before` was invoked. Any
//! `before` may short-circuit with a response (auth redirect, 429, 503);
//! traversal stops there and the symmetric `after` pass still runs.
//!
//! The built-in chain is fixed at startup: Authentication (50),
//! RateLimit (100), CircuitBreaker (200), HeaderTransform (300). Plugins
//! are a closed variant set so the pipeline stays auditable; adding one
//! means extending the enum, not registering at runtime.

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body;
use hyper::{HeaderMap, Method, Response, http::request::Parts};

use crate::core::{
    auth::AuthPlugin,
    circuit_breaker::{BreakerDecision, BreakerRegistry, CircuitState, ProbeGuard},
    headers::HeaderTransformPlugin,
    rate_limit::RateLimitPlugin,
    route::Route,
};

/// Per-request state threaded through the pipeline.
pub struct GatewayContext {
    pub request_id: String,
    pub client_ip: Option<IpAddr>,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Snapshot of the inbound headers.
    pub headers: HeaderMap,
    pub scheme: String,
    pub host: String,
    pub route: Option<Arc<Route>>,
    pub start_time: Instant,
    /// Wall-clock deadline for the whole request, including retries.
    pub deadline: Instant,

    /// Headers the proxy will send upstream, built by HeaderTransform.
    pub forward_headers: HeaderMap,
    /// Set by the auth plugin once the request is authenticated.
    pub authenticated: bool,
    /// Set when the breaker short-circuited this request, so its `after`
    /// pass does not count the rejection as an upstream outcome.
    pub circuit_rejected: bool,
    /// Set by the proxy once an upstream attempt was actually made.
    pub forward_attempted: bool,
    /// Held while this request is a half-open probe.
    pub probe: Option<ProbeGuard>,
}

impl GatewayContext {
    pub fn new(
        parts: &Parts,
        client_ip: Option<IpAddr>,
        request_id: String,
        proxy_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        let host = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Self {
            request_id,
            client_ip,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(String::from),
            headers: parts.headers.clone(),
            scheme: parts
                .uri
                .scheme_str()
                .unwrap_or("http")
                .to_string(),
            host,
            route: None,
            start_time: now,
            deadline: now + proxy_timeout,
            forward_headers: HeaderMap::new(),
            authenticated: false,
            circuit_rejected: false,
            forward_attempted: false,
            probe: None,
        }
    }

    /// The full original URL, used for login redirects.
    pub fn original_url(&self) -> String {
        match &self.query {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.host, self.path, q),
            None => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}

/// Result of a plugin's `before` hook.
pub enum PluginOutcome {
    Continue,
    Respond(Response<Body>),
}

/// The closed set of built-in plugins.
pub enum GatewayPlugin {
    Auth(AuthPlugin),
    RateLimit(RateLimitPlugin),
    CircuitBreaker(CircuitBreakerPlugin),
    HeaderTransform(HeaderTransformPlugin),
}

impl GatewayPlugin {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "authentication",
            Self::RateLimit(_) => "rate_limit",
            Self::CircuitBreaker(_) => "circuit_breaker",
            Self::HeaderTransform(_) => "header_transform",
        }
    }

    pub fn priority(&self) -> u32 {
        match self {
            Self::Auth(_) => 50,
            Self::RateLimit(_) => 100,
            Self::CircuitBreaker(_) => 200,
            Self::HeaderTransform(_) => 300,
        }
    }

    async fn before(&self, ctx: &mut GatewayContext) -> PluginOutcome {
        match self {
            Self::Auth(plugin) => plugin.before(ctx).await,
            Self::RateLimit(plugin) => {
                let route_id = ctx
                    .route
                    .as_ref()
                    .map(|r| r.route_id.clone())
                    .unwrap_or_else(|| ctx.path.clone());
                match plugin.allow(&route_id, ctx.client_ip) {
                    Ok(()) => PluginOutcome::Continue,
                    Err(denied) => {
                        tracing::warn!(
                            route_id = %route_id,
                            scope = denied.scope.as_str(),
                            client_ip = ?ctx.client_ip,
                            "rate limit exceeded"
                        );
                        PluginOutcome::Respond(RateLimitPlugin::deny_response(&denied))
                    }
                }
            }
            Self::CircuitBreaker(plugin) => plugin.before(ctx),
            Self::HeaderTransform(plugin) => {
                plugin.apply(ctx);
                PluginOutcome::Continue
            }
        }
    }

    async fn after(&self, ctx: &mut GatewayContext, response: Response<Body>) -> Response<Body> {
        match self {
            Self::Auth(_) | Self::RateLimit(_) => response,
            Self::CircuitBreaker(plugin) => plugin.after(ctx, response),
            Self::HeaderTransform(plugin) => plugin.finalize(ctx, response),
        }
    }
}

/// Circuit breaker hooks bound to the per-target registry.
pub struct CircuitBreakerPlugin {
    registry: Arc<BreakerRegistry>,
}

impl CircuitBreakerPlugin {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    fn before(&self, ctx: &mut GatewayContext) -> PluginOutcome {
        let Some(route) = ctx.route.clone() else {
            return PluginOutcome::Continue;
        };
        let key = route.target_key();

        match self.registry.check(key) {
            BreakerDecision::Allow { probe } => {
                if probe {
                    ctx.probe = Some(ProbeGuard::new(self.registry.clone(), key.to_string()));
                }
                PluginOutcome::Continue
            }
            BreakerDecision::Reject {
                retry_after_secs,
                state,
            } => {
                tracing::warn!(target_key = key, state = state.as_str(), "circuit rejecting");
                ctx.circuit_rejected = true;
                PluginOutcome::Respond(self.registry.reject_response(key, retry_after_secs, state))
            }
        }
    }

    fn after(&self, ctx: &mut GatewayContext, mut response: Response<Body>) -> Response<Body> {
        let Some(route) = ctx.route.clone() else {
            return response;
        };
        let key = route.target_key();

        // Only an actual upstream attempt updates the state machine: a
        // breaker rejection or a pre-forward failure (no healthy instance)
        // says nothing about the upstream itself.
        if !ctx.circuit_rejected && ctx.forward_attempted {
            let probe = ctx.probe.take();
            let was_probe = probe.is_some();
            if let Some(guard) = probe {
                guard.disarm();
            }
            if response.status().is_server_error() {
                self.registry.record_failure(key, was_probe);
            } else {
                self.registry.record_success(key, was_probe);
            }
        }

        let state: CircuitState = self.registry.state(key);
        if let Ok(value) = hyper::header::HeaderValue::from_str(state.as_str()) {
            response.headers_mut().insert("X-Circuit-State", value);
        }
        response
    }
}

/// Ordered plugin pipeline; composition is fixed at construction.
pub struct PluginChain {
    plugins: Vec<GatewayPlugin>,
}

/// Outcome of the `before` pass: how many plugins ran, and the
/// short-circuit response if one fired.
pub struct BeforeOutcome {
    pub invoked: usize,
    pub response: Option<Response<Body>>,
}

impl PluginChain {
    pub fn new(mut plugins: Vec<GatewayPlugin>) -> Self {
        plugins.sort_by_key(|p| p.priority());
        Self { plugins }
    }

    pub fn plugins(&self) -> &[GatewayPlugin] {
        &self.plugins
    }

    pub async fn run_before(&self, ctx: &mut GatewayContext) -> BeforeOutcome {
        for (index, plugin) in self.plugins.iter().enumerate() {
            if let PluginOutcome::Respond(response) = plugin.before(ctx).await {
                return BeforeOutcome {
                    invoked: index + 1,
                    response: Some(response),
                };
            }
        }
        BeforeOutcome {
            invoked: self.plugins.len(),
            response: None,
        }
    }

    /// Run `after` hooks in reverse order over the invoked prefix.
    pub async fn run_after(
        &self,
        ctx: &mut GatewayContext,
        mut response: Response<Body>,
        invoked: usize,
    ) -> Response<Body> {
        let upto = invoked.min(self.plugins.len());
        for plugin in self.plugins[..upto].iter().rev() {
            response = plugin.after(ctx, response).await;
        }
        response
    }
}

/// Compose the built-in chain from configuration. Disabled plugins are
/// left out entirely; HeaderTransform is always present.
pub fn create_default_chain(
    config: &crate::config::models::GatewayConfig,
    http_client: Arc<dyn crate::ports::http_client::HttpClient>,
    instances: Arc<crate::core::balancer::InstanceRegistry>,
) -> (PluginChain, Arc<BreakerRegistry>) {
    use crate::core::circuit_breaker::BreakerSettings;

    let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
        failure_threshold: config.circuit_breaker_failure_threshold,
        reset_timeout: Duration::from_secs(config.circuit_breaker_timeout),
    }));

    let mut plugins = Vec::new();
    if config.auth_plugin_enabled {
        plugins.push(GatewayPlugin::Auth(crate::core::auth::AuthPlugin::new(
            config.auth_degrade_allow,
            http_client,
            instances,
        )));
    }
    if config.rate_limit_enabled {
        plugins.push(GatewayPlugin::RateLimit(RateLimitPlugin::new(config)));
    }
    if config.circuit_breaker_enabled {
        plugins.push(GatewayPlugin::CircuitBreaker(CircuitBreakerPlugin::new(
            breakers.clone(),
        )));
    }
    plugins.push(GatewayPlugin::HeaderTransform(HeaderTransformPlugin::new()));

    (PluginChain::new(plugins), breakers)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::{Request, StatusCode};

    use super::*;
    use crate::{
        config::models::{GatewayConfig, RouteEntry},
        core::{
            circuit_breaker::BreakerSettings,
            route::{Route, RouteSource},
        },
    };

    fn test_ctx(path: &str) -> GatewayContext {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://gateway.local{path}"))
            .header("host", "gateway.local")
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();
        GatewayContext::new(
            &parts,
            Some("10.1.1.1".parse().unwrap()),
            "req-1".to_string(),
            Duration::from_secs(30),
        )
    }

    fn service_route(service_id: &str) -> Arc<Route> {
        let entry = RouteEntry {
            path_pattern: "/api/**".to_string(),
            target_service_id: Some(service_id.to_string()),
            ..RouteEntry::default()
        };
        Arc::new(Route::from_entry(entry, "r1".into(), RouteSource::Remote, 0, None).unwrap())
    }

    fn breaker_chain(threshold: u32) -> (PluginChain, Arc<BreakerRegistry>) {
        let registry = Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(30),
        }));
        let chain = PluginChain::new(vec![
            GatewayPlugin::CircuitBreaker(CircuitBreakerPlugin::new(registry.clone())),
            GatewayPlugin::HeaderTransform(HeaderTransformPlugin::new()),
        ]);
        (chain, registry)
    }

    #[test]
    fn chain_orders_plugins_by_priority() {
        let config = GatewayConfig::default();
        let registry = Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }));
        let chain = PluginChain::new(vec![
            GatewayPlugin::HeaderTransform(HeaderTransformPlugin::new()),
            GatewayPlugin::CircuitBreaker(CircuitBreakerPlugin::new(registry)),
            GatewayPlugin::RateLimit(RateLimitPlugin::new(&config)),
        ]);
        let names: Vec<_> = chain.plugins().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["rate_limit", "circuit_breaker", "header_transform"]);
    }

    #[tokio::test]
    async fn short_circuit_stops_before_traversal() {
        let config = GatewayConfig {
            rate_limit_global_qps: 1.0,
            rate_limit_burst_multiplier: 1.0,
            ..GatewayConfig::default()
        };
        let chain = PluginChain::new(vec![
            GatewayPlugin::RateLimit(RateLimitPlugin::new(&config)),
            GatewayPlugin::HeaderTransform(HeaderTransformPlugin::new()),
        ]);

        let mut first_ctx = test_ctx("/api/x");
        first_ctx.route = Some(service_route("svc"));
        let first = chain.run_before(&mut first_ctx).await;
        assert!(first.response.is_none());
        assert_eq!(first.invoked, 2);
        assert!(first_ctx.forward_headers.get("X-Forwarded-For").is_some());

        let mut second_ctx = test_ctx("/api/x");
        second_ctx.route = Some(service_route("svc"));
        let second = chain.run_before(&mut second_ctx).await;
        let response = second.response.expect("second request should be limited");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.invoked, 1);
        // HeaderTransform never ran for the limited request.
        assert!(second_ctx.forward_headers.is_empty());
    }

    #[tokio::test]
    async fn breaker_counts_forwarded_server_errors() {
        let (chain, registry) = breaker_chain(2);

        for _ in 0..2 {
            let mut ctx = test_ctx("/api/x");
            ctx.route = Some(service_route("svc"));
            let before = chain.run_before(&mut ctx).await;
            assert!(before.response.is_none());
            ctx.forward_attempted = true;

            let bad = Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .unwrap();
            let out = chain.run_after(&mut ctx, bad, before.invoked).await;
            assert_eq!(out.status(), StatusCode::BAD_GATEWAY);
        }

        assert_eq!(registry.state("svc"), CircuitState::Open);

        // The next request is rejected up front and does not flip state
        // when its after pass runs.
        let mut ctx = test_ctx("/api/x");
        ctx.route = Some(service_route("svc"));
        let before = chain.run_before(&mut ctx).await;
        let response = before.response.expect("open circuit should reject");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = chain.run_after(&mut ctx, response, before.invoked).await;
        assert_eq!(
            response.headers().get("X-Circuit-State").unwrap(),
            "open"
        );
        assert_eq!(registry.state("svc"), CircuitState::Open);
    }

    #[tokio::test]
    async fn breaker_ignores_responses_without_forward_attempt() {
        let (chain, registry) = breaker_chain(1);

        let mut ctx = test_ctx("/api/x");
        ctx.route = Some(service_route("svc"));
        let before = chain.run_before(&mut ctx).await;

        // A 503 produced by the gateway itself (no healthy instance) must
        // not trip the breaker.
        let resp = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::empty())
            .unwrap();
        chain.run_after(&mut ctx, resp, before.invoked).await;
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fourxx_counts_as_breaker_success() {
        let (chain, registry) = breaker_chain(1);
        registry.record_failure("svc", false);
        assert_eq!(registry.state("svc"), CircuitState::Open);

        // Different target stays closed even with a 404 flowing through.
        let mut ctx = test_ctx("/api/x");
        ctx.route = Some(service_route("other"));
        let before = chain.run_before(&mut ctx).await;
        ctx.forward_attempted = true;
        let resp = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap();
        chain.run_after(&mut ctx, resp, before.invoked).await;
        assert_eq!(registry.state("other"), CircuitState::Closed);
    }
}
