//! Forward-header construction.
//!
//! Copies the inbound headers minus hop-by-hop and `Host`, then layers the
//! gateway's tracing and forwarding headers on top. The proxy sends exactly
//! this map upstream.

use hyper::{HeaderMap, header, header::HeaderValue};

use crate::core::plugin::GatewayContext;

/// Headers defined by RFC 7230 as connection-scoped; never forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

pub struct HeaderTransformPlugin;

impl HeaderTransformPlugin {
    pub fn new() -> Self {
        Self
    }

    /// Build `ctx.forward_headers` for the upstream call.
    pub fn apply(&self, ctx: &mut GatewayContext) {
        let mut forward = HeaderMap::with_capacity(ctx.headers.len() + 6);

        for (name, value) in ctx.headers.iter() {
            if is_hop_by_hop(name.as_str()) || *name == header::HOST {
                continue;
            }
            forward.append(name.clone(), value.clone());
        }

        insert_str(&mut forward, "X-Request-ID", &ctx.request_id);

        if let Some(ip) = ctx.client_ip {
            let ip = ip.to_string();
            // Append to an existing chain rather than replacing it.
            let chain = match ctx
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip.clone(),
            };
            insert_str(&mut forward, "X-Forwarded-For", &chain);
            insert_str(&mut forward, "X-Real-IP", &ip);
        }

        insert_str(&mut forward, "X-Forwarded-Proto", &ctx.scheme);
        insert_str(&mut forward, "X-Forwarded-Host", &ctx.host);

        if let Some(prefix) = ctx
            .route
            .as_ref()
            .and_then(|r| r.strip_path.as_deref())
        {
            insert_str(&mut forward, "X-Forwarded-Prefix", prefix);
        }

        ctx.forward_headers = forward;
    }

    /// Ensure the response carries the request id.
    pub fn finalize(
        &self,
        ctx: &GatewayContext,
        mut response: hyper::Response<axum::body::Body>,
    ) -> hyper::Response<axum::body::Body> {
        if !response.headers().contains_key("X-Request-ID") {
            if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
                response.headers_mut().insert("X-Request-ID", value);
            }
        }
        response
    }
}

impl Default for HeaderTransformPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_str(map: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            map.insert(name, v);
        }
        Err(_) => tracing::warn!(header = name, "dropping unrepresentable header value"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::{Method, Request};

    use super::*;
    use crate::{
        config::models::RouteEntry,
        core::route::{Route, RouteSource},
    };

    fn ctx_with_headers(extra: &[(&str, &str)]) -> GatewayContext {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri("http://gw.example/api/users")
            .header("host", "gw.example")
            .header("authorization", "Bearer tok-123456")
            .header("connection", "keep-alive")
            .header("transfer-encoding", "chunked");
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        GatewayContext::new(
            &parts,
            Some("203.0.113.7".parse().unwrap()),
            "req-42".to_string(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn hop_by_hop_and_host_are_dropped() {
        let mut ctx = ctx_with_headers(&[]);
        HeaderTransformPlugin::new().apply(&mut ctx);

        let forward = &ctx.forward_headers;
        assert!(forward.get("connection").is_none());
        assert!(forward.get("transfer-encoding").is_none());
        assert!(forward.get("host").is_none());
        assert_eq!(forward.get("authorization").unwrap(), "Bearer tok-123456");
    }

    #[test]
    fn tracing_headers_are_injected() {
        let mut ctx = ctx_with_headers(&[]);
        HeaderTransformPlugin::new().apply(&mut ctx);

        let forward = &ctx.forward_headers;
        assert_eq!(forward.get("X-Request-ID").unwrap(), "req-42");
        assert_eq!(forward.get("X-Forwarded-For").unwrap(), "203.0.113.7");
        assert_eq!(forward.get("X-Forwarded-Proto").unwrap(), "http");
        assert_eq!(forward.get("X-Forwarded-Host").unwrap(), "gw.example");
        assert_eq!(forward.get("X-Real-IP").unwrap(), "203.0.113.7");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut ctx = ctx_with_headers(&[("x-forwarded-for", "198.51.100.9")]);
        HeaderTransformPlugin::new().apply(&mut ctx);
        assert_eq!(
            ctx.forward_headers.get("X-Forwarded-For").unwrap(),
            "198.51.100.9, 203.0.113.7"
        );
    }

    #[test]
    fn strip_path_becomes_forwarded_prefix() {
        let entry = RouteEntry {
            path_pattern: "/api/**".to_string(),
            target_url: Some("http://backend".to_string()),
            strip_prefix: true,
            strip_path: Some("/api".to_string()),
            ..RouteEntry::default()
        };
        let route = Route::from_entry(entry, "r".into(), RouteSource::Local, 0, None).unwrap();

        let mut ctx = ctx_with_headers(&[]);
        ctx.route = Some(std::sync::Arc::new(route));
        HeaderTransformPlugin::new().apply(&mut ctx);
        assert_eq!(ctx.forward_headers.get("X-Forwarded-Prefix").unwrap(), "/api");
    }
}
