//! Configuration loading.
//!
//! Gateway settings come from `HERMES_*` environment variables via the
//! `config` crate; the local route file is YAML parsed through the same
//! crate so both surfaces share one deserialization path.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::{
    config::models::{GatewayConfig, RoutesFile},
    core::route::{Route, RouteSource},
};

/// Load gateway settings from the environment (prefix `HERMES_`).
pub fn load_gateway_config() -> Result<GatewayConfig> {
    let settings = Config::builder()
        .add_source(Environment::with_prefix("HERMES").try_parsing(true))
        .build()
        .context("Failed to read HERMES_* environment")?;

    settings
        .try_deserialize()
        .context("Failed to deserialize gateway configuration")
}

/// Parse the local route file. A missing file is not an error: the gateway
/// simply runs without local routes.
pub fn load_routes_file(path: &str) -> Result<RoutesFile> {
    if !Path::new(path).exists() {
        tracing::debug!(path, "local route file not found");
        return Ok(RoutesFile::default());
    }

    let settings = Config::builder()
        .add_source(File::new(path, FileFormat::Yaml))
        .build()
        .with_context(|| format!("Failed to parse local route file {path}"))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize local route file {path}"))
}

/// Build local [`Route`]s from the route file, applying the priority boost
/// and the file-level default auth block. Malformed entries are dropped
/// with a warning; the rest install.
pub fn build_local_routes(file: &RoutesFile, priority_boost: i32) -> Vec<Route> {
    let mut routes = Vec::with_capacity(file.routes.len());
    for (index, entry) in file.routes.iter().enumerate() {
        let route_id = format!("local-{}", index + 1);
        match Route::from_entry(
            entry.clone(),
            route_id.clone(),
            RouteSource::Local,
            priority_boost,
            file.default_auth_config.as_ref(),
        ) {
            Ok(route) => routes.push(route),
            Err(e) => {
                tracing::warn!(route_id = %route_id, error = %e, "skipping malformed local route");
            }
        }
    }
    routes
}
