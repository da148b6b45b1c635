//! Authentication plugin.
//!
//! Runs first in the chain. Routes opt in through their `auth_config`;
//! paths listed in `public_paths` bypass authentication entirely,
//! regardless of whether the auth service is reachable. Tokens are taken
//! from the `Authorization` header, the `access_token` cookie, or
//! `X-Auth-Token`, and verified against the route's auth service when one
//! is configured. An unreachable auth service either fails the request
//! with 503 or waves it through, per `auth_degrade_allow`.

use std::sync::Arc;

use axum::body::Body;
use hyper::{HeaderMap, Request, Response, StatusCode, header};

use crate::{
    core::{
        balancer::InstanceRegistry,
        error::{GatewayError, json_response},
        plugin::{GatewayContext, PluginOutcome},
        route::AuthPolicy,
    },
    ports::http_client::HttpClient,
};

const VALIDATE_ENDPOINT: &str = "/api/v1/auth/validate";
const MIN_TOKEN_LEN: usize = 10;

enum Verdict {
    Valid,
    Invalid,
    Unavailable,
}

pub struct AuthPlugin {
    degrade_allow: bool,
    http_client: Arc<dyn HttpClient>,
    instances: Arc<InstanceRegistry>,
}

impl AuthPlugin {
    pub fn new(
        degrade_allow: bool,
        http_client: Arc<dyn HttpClient>,
        instances: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            degrade_allow,
            http_client,
            instances,
        }
    }

    pub async fn before(&self, ctx: &mut GatewayContext) -> PluginOutcome {
        let Some(route) = ctx.route.clone() else {
            return PluginOutcome::Continue;
        };
        let Some(auth) = route.auth.as_ref() else {
            return PluginOutcome::Continue;
        };
        if !auth.require_auth {
            return PluginOutcome::Continue;
        }
        if auth.is_public(&ctx.path) {
            tracing::debug!(path = %ctx.path, "public path, skipping authentication");
            return PluginOutcome::Continue;
        }

        if let Some(token) = extract_token(&ctx.headers) {
            match self.validate(&token, auth).await {
                Verdict::Valid => {
                    ctx.authenticated = true;
                    return PluginOutcome::Continue;
                }
                Verdict::Invalid => {
                    tracing::debug!(path = %ctx.path, "token rejected");
                }
                Verdict::Unavailable => {
                    if self.degrade_allow {
                        tracing::warn!(
                            path = %ctx.path,
                            "auth service unreachable, degrading open"
                        );
                        ctx.authenticated = true;
                        return PluginOutcome::Continue;
                    }
                    return PluginOutcome::Respond(GatewayError::AuthUnavailable.into_response());
                }
            }
        }

        tracing::debug!(path = %ctx.path, client_ip = ?ctx.client_ip, "unauthenticated request");
        PluginOutcome::Respond(deny_response(ctx, auth))
    }

    async fn validate(&self, token: &str, auth: &AuthPolicy) -> Verdict {
        if token.len() < MIN_TOKEN_LEN {
            return Verdict::Invalid;
        }

        let Some(service_id) = auth.auth_service_id.as_deref() else {
            // Pass-through mode: no auth service configured, a present
            // token is accepted and forwarded as-is.
            return Verdict::Valid;
        };

        let Some(instance) = self
            .instances
            .snapshot(service_id)
            .into_iter()
            .find(|i| i.healthy)
        else {
            tracing::warn!(service_id, "auth service has no healthy instance");
            return Verdict::Unavailable;
        };

        let url = format!(
            "{}{VALIDATE_ENDPOINT}",
            instance.base_url.trim_end_matches('/')
        );
        let request = match Request::builder()
            .method(hyper::Method::POST)
            .uri(&url)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(service_id, error = %e, "failed to build validation request");
                return Verdict::Unavailable;
            }
        };

        match self.http_client.send_request(request).await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::OK {
                    Verdict::Valid
                } else if status == StatusCode::UNAUTHORIZED {
                    Verdict::Invalid
                } else {
                    tracing::warn!(service_id, %status, "unexpected auth service status");
                    Verdict::Unavailable
                }
            }
            Err(e) => {
                tracing::warn!(service_id, error = %e, "auth service call failed");
                Verdict::Unavailable
            }
        }
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return Some(
            value
                .strip_prefix("Bearer ")
                .unwrap_or(value)
                .to_string(),
        );
    }

    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "access_token" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn deny_response(ctx: &GatewayContext, auth: &AuthPolicy) -> Response<Body> {
    if let Some(login) = auth.login_redirect.as_deref() {
        let location = build_redirect_url(login, &ctx.original_url());
        if let Ok(value) = header::HeaderValue::from_str(&location) {
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, value)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()));
        }
    }

    let mut response = json_response(
        StatusCode::UNAUTHORIZED,
        &serde_json::json!({ "error": "unauthorized" }),
    );
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Bearer"));
    response
}

/// Set `redirect=<original>` on the login URL. The query string is parsed
/// and rebuilt so parameters already on the login URL survive and a
/// pre-existing `redirect` key is overwritten, never duplicated.
fn build_redirect_url(login_url: &str, original_url: &str) -> String {
    let (base, query) = match login_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (login_url, None),
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key != "redirect" {
                serializer.append_pair(&key, &value);
            }
        }
    }
    serializer.append_pair("redirect", original_url);

    format!("{base}?{}", serializer.finish())
}
