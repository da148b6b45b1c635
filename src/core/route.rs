//! Route descriptors and path pattern compilation.
//!
//! A [`Route`] is an immutable rule mapping a path/method pattern to an
//! upstream target (a direct URL or a registry service id) with attached
//! policies. Patterns support `*` (exactly one path segment), a trailing
//! `**` (zero or more segments) and `{param}` placeholders, compiled once
//! into a `regex::Regex` so the hot matching path is a single `is_match`.

use hyper::Method;
use regex::Regex;
use thiserror::Error;

use crate::config::models::{AuthConfigEntry, MethodsEntry, RouteEntry};

/// Errors raised while building a [`Route`] from a config or registry entry.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteError {
    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route '{route_id}' must set exactly one of target_url / target_service_id")]
    AmbiguousTarget { route_id: String },

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
}

/// A compiled path pattern.
///
/// Grammar: literal segments separated by `/`; `*` matches exactly one
/// non-empty segment; `**` matches any suffix (including the empty one) and
/// is only allowed as the final token; `{name}` matches one segment.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
    literal_prefix: String,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        // A trailing "/**" (or a bare "/**"-style pattern) swallows any
        // suffix, including zero segments, so "/api/**" also matches "/api".
        let (base, any_suffix) = match pattern.strip_suffix("/**") {
            Some(base) => (base, true),
            None => (pattern.trim_end_matches('/'), false),
        };

        if base.contains("**") {
            return Err(invalid("'**' is only allowed as the final token"));
        }

        let mut regex_src = String::from("^");
        if !base.is_empty() {
            for segment in base.split('/').skip(1) {
                regex_src.push('/');
                regex_src.push_str(&Self::segment_regex(segment, pattern)?);
            }
        }
        if any_suffix {
            regex_src.push_str("(?:/.*)?");
        } else if base.is_empty() {
            // The root pattern "/" matches exactly the root path.
            regex_src.push('/');
        }
        regex_src.push('$');

        let regex = Regex::new(&regex_src)
            .map_err(|e| invalid(&format!("does not compile: {e}")))?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
            literal_prefix: Self::compute_literal_prefix(base),
        })
    }

    fn segment_regex(segment: &str, pattern: &str) -> Result<String, RouteError> {
        if segment == "*" {
            return Ok("[^/]+".to_string());
        }

        let mut out = String::new();
        let mut chars = segment.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => out.push_str("[^/]*"),
                '{' => {
                    // Consume through the closing brace; the parameter name
                    // itself is irrelevant for matching.
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(_) => continue,
                            None => {
                                return Err(RouteError::InvalidPattern {
                                    pattern: pattern.to_string(),
                                    reason: "unterminated '{' placeholder".to_string(),
                                });
                            }
                        }
                    }
                    out.push_str("[^/]+");
                }
                other => out.push_str(&regex::escape(&other.to_string())),
            }
        }
        Ok(out)
    }

    fn compute_literal_prefix(base: &str) -> String {
        let mut prefix = String::new();
        for segment in base.split('/').skip(1) {
            if segment.contains('*') || segment.contains('{') {
                break;
            }
            prefix.push('/');
            prefix.push_str(segment);
        }
        prefix
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The leading wildcard-free portion of the pattern ("/auth" for
    /// "/auth/**"). Used as the default prefix to strip before forwarding.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    /// Whether the pattern is a literal path with no wildcard tokens.
    /// Exact patterns outrank wildcard ones at equal priority and source.
    pub fn is_exact(&self) -> bool {
        !self.raw.contains('*') && !self.raw.contains('{')
    }
}

/// The set of HTTP methods a route admits.
#[derive(Debug, Clone)]
pub enum MethodFilter {
    Any,
    Only(Vec<Method>),
}

impl MethodFilter {
    pub fn parse(entry: &MethodsEntry) -> Result<Self, RouteError> {
        let names: Vec<String> = match entry {
            MethodsEntry::Wildcard(s) if s.trim() == "*" => return Ok(Self::Any),
            // A comma-separated string ("GET,POST") is accepted alongside
            // the list form for registry compatibility.
            MethodsEntry::Wildcard(s) => {
                s.split(',').map(|m| m.trim().to_string()).collect()
            }
            MethodsEntry::List(v) => v.clone(),
        };

        let mut methods = Vec::with_capacity(names.len());
        for name in names {
            let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                .map_err(|_| RouteError::InvalidMethod(name.clone()))?;
            methods.push(method);
        }
        Ok(Self::Only(methods))
    }

    pub fn admits(&self, method: &Method) -> bool {
        match self {
            Self::Any => true,
            Self::Only(methods) => methods.contains(method),
        }
    }
}

/// Authentication policy attached to a route.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub require_auth: bool,
    pub auth_service_id: Option<String>,
    pub public_paths: Vec<PathPattern>,
    pub login_redirect: Option<String>,
}

impl AuthPolicy {
    fn from_entry(entry: &AuthConfigEntry) -> Result<Self, RouteError> {
        let public_paths = entry
            .public_paths
            .iter()
            .map(|p| PathPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            require_auth: entry.require_auth,
            auth_service_id: entry.auth_service_id.clone(),
            public_paths,
            login_redirect: entry.login_redirect.clone(),
        })
    }

    /// Whether the given path bypasses authentication entirely.
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p.matches(path))
    }
}

/// Where a request is forwarded once a route matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// An absolute upstream URL, used as-is.
    DirectUrl(String),
    /// A service id resolved through the registry to an instance set.
    Service(String),
}

/// Origin of a route definition. Local routes sort ahead of remote ones at
/// equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteSource {
    Local,
    Remote,
}

/// An immutable routing rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: String,
    pub pattern: PathPattern,
    pub methods: MethodFilter,
    pub priority: i32,
    pub target: RouteTarget,
    pub strip_prefix: bool,
    pub strip_path: Option<String>,
    pub auth: Option<AuthPolicy>,
    pub source: RouteSource,
    pub enabled: bool,
    /// Opt-in to retrying non-idempotent methods (POST/PUT/PATCH/DELETE).
    pub retry_non_idempotent: bool,
}

impl Route {
    /// Build a route from a parsed config/registry entry.
    ///
    /// `priority_boost` is added to the declared priority (used for local
    /// routes); `default_auth` fills in when the entry has no auth block.
    pub fn from_entry(
        entry: RouteEntry,
        route_id: String,
        source: RouteSource,
        priority_boost: i32,
        default_auth: Option<&AuthConfigEntry>,
    ) -> Result<Self, RouteError> {
        let target = match (&entry.target_url, &entry.target_service_id) {
            (Some(url), None) => RouteTarget::DirectUrl(url.clone()),
            (None, Some(service_id)) => RouteTarget::Service(service_id.clone()),
            _ => return Err(RouteError::AmbiguousTarget { route_id }),
        };

        let pattern = PathPattern::compile(&entry.path_pattern)?;
        let methods = MethodFilter::parse(&entry.methods)?;
        let auth = entry
            .auth_config
            .as_ref()
            .or(default_auth)
            .map(AuthPolicy::from_entry)
            .transpose()?;

        Ok(Self {
            route_id,
            pattern,
            methods,
            priority: entry.priority.saturating_add(priority_boost),
            target,
            strip_prefix: entry.strip_prefix,
            strip_path: entry.strip_path,
            auth,
            source,
            enabled: entry.enabled,
            retry_non_idempotent: entry.retry_non_idempotent,
        })
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.enabled && self.pattern.matches(path) && self.methods.admits(method)
    }

    /// The key under which this route's upstream is tracked by the circuit
    /// breaker (service id or the direct URL itself).
    pub fn target_key(&self) -> &str {
        match &self.target {
            RouteTarget::DirectUrl(url) => url,
            RouteTarget::Service(service_id) => service_id,
        }
    }

    /// The path forwarded upstream, after optional prefix stripping.
    pub fn upstream_path(&self, request_path: &str) -> String {
        if !self.strip_prefix {
            return request_path.to_string();
        }

        let prefix = self
            .strip_path
            .as_deref()
            .unwrap_or_else(|| self.pattern.literal_prefix())
            .trim_end_matches('/');

        let stripped = match request_path.strip_prefix(prefix) {
            Some(rest) => rest,
            None => request_path,
        };

        if stripped.is_empty() {
            "/".to_string()
        } else if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{stripped}")
        }
    }
}
