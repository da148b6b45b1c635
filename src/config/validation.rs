//! Startup configuration validation.
//!
//! Errors are accumulated and reported together; any error here is fatal
//! at startup (the process exits non-zero), unlike the per-entry route
//! parse failures which only drop the offending entry.

use std::net::SocketAddr;

use crate::{
    config::models::{GatewayConfig, RouteEntry, RoutesFile},
    core::route::{MethodFilter, PathPattern},
};

pub type ValidationResult<T> = Result<T, ValidationError>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid route #{index}: {message}")]
    InvalidRoute { index: usize, message: String },

    #[error("Validation failed:\n{message}")]
    ValidationFailed { message: String },
}

pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the process configuration and the local route file.
    pub fn validate(config: &GatewayConfig, routes: &RoutesFile) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.listen_addr().parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidListenAddress {
                address: config.listen_addr(),
                reason: "host/port must form 'IP:PORT' (e.g. '0.0.0.0:8880')".to_string(),
            });
        }

        if config.registry_enabled && !config.registry_url.starts_with("http") {
            errors.push(ValidationError::InvalidField {
                field: "registry_url".to_string(),
                message: "must start with http:// or https://".to_string(),
            });
        }

        if config.rate_limit_enabled {
            for (field, value) in [
                ("rate_limit_global_qps", config.rate_limit_global_qps),
                ("rate_limit_per_route_qps", config.rate_limit_per_route_qps),
                ("rate_limit_per_ip_qps", config.rate_limit_per_ip_qps),
            ] {
                if value <= 0.0 {
                    errors.push(ValidationError::InvalidField {
                        field: field.to_string(),
                        message: "must be greater than 0".to_string(),
                    });
                }
            }
            if config.rate_limit_ip_map_capacity == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "rate_limit_ip_map_capacity".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }

        if config.circuit_breaker_enabled && config.circuit_breaker_failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker_failure_threshold".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if config.proxy_timeout == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy_timeout".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }

        for (index, entry) in routes.routes.iter().enumerate() {
            if let Err(e) = Self::validate_route_entry(entry) {
                errors.push(ValidationError::InvalidRoute { index, message: e });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
        }
    }

    fn validate_route_entry(entry: &RouteEntry) -> Result<(), String> {
        PathPattern::compile(&entry.path_pattern).map_err(|e| e.to_string())?;
        MethodFilter::parse(&entry.methods).map_err(|e| e.to_string())?;

        match (&entry.target_url, &entry.target_service_id) {
            (Some(_), Some(_)) | (None, None) => {
                return Err("exactly one of target_url / target_service_id is required".into());
            }
            (Some(url), None) if !url.starts_with("http") => {
                return Err(format!("target_url '{url}' must start with http:// or https://"));
            }
            _ => {}
        }

        if let Some(auth) = &entry.auth_config {
            for pattern in &auth.public_paths {
                PathPattern::compile(pattern)
                    .map_err(|e| format!("public path {e}"))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::AuthConfigEntry;

    #[test]
    fn default_config_validates() {
        let config = GatewayConfig::default();
        assert!(GatewayConfigValidator::validate(&config, &RoutesFile::default()).is_ok());
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let config = GatewayConfig {
            host: "not an ip".to_string(),
            ..GatewayConfig::default()
        };
        assert!(GatewayConfigValidator::validate(&config, &RoutesFile::default()).is_err());
    }

    #[test]
    fn zero_qps_with_limiting_enabled_is_rejected() {
        let config = GatewayConfig {
            rate_limit_global_qps: 0.0,
            ..GatewayConfig::default()
        };
        assert!(GatewayConfigValidator::validate(&config, &RoutesFile::default()).is_err());
    }

    #[test]
    fn route_with_uncompilable_public_path_is_rejected() {
        let routes = RoutesFile {
            routes: vec![RouteEntry {
                path_pattern: "/api/**".to_string(),
                target_url: Some("http://backend".to_string()),
                auth_config: Some(AuthConfigEntry {
                    require_auth: true,
                    public_paths: vec!["/api/**/nested".to_string()],
                    ..AuthConfigEntry::default()
                }),
                ..RouteEntry::default()
            }],
            default_auth_config: None,
        };
        let result = GatewayConfigValidator::validate(&GatewayConfig::default(), &routes);
        assert!(result.is_err());
    }

    #[test]
    fn errors_accumulate_across_fields() {
        let config = GatewayConfig {
            host: "bad".to_string(),
            proxy_timeout: 0,
            ..GatewayConfig::default()
        };
        let err = GatewayConfigValidator::validate(&config, &RoutesFile::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("listen address"));
        assert!(message.contains("proxy_timeout"));
    }
}
