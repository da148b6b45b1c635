//! Port for the external service registry (ServiceAtlas).
//!
//! The gateway consumes two read-only endpoints: the route list and the
//! per-service instance list. The transport is an adapter so refresh logic
//! can be driven against an in-process stub in tests.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::config::models::RouteEntry;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(String),

    #[error("registry returned HTTP {0}")]
    Status(u16),

    #[error("registry payload did not decode: {0}")]
    Decode(String),
}

/// A route rule as served by `GET /api/v1/gateway/routes`: the local-file
/// schema plus a server-assigned id.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRoute {
    #[serde(deserialize_with = "id_as_string")]
    pub route_id: String,
    #[serde(flatten)]
    pub entry: RouteEntry,
}

/// One entry of `GET /api/v1/services/{id}/instances`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub base_url: String,
    #[serde(default = "healthy_default")]
    pub healthy: bool,
}

fn healthy_default() -> bool {
    true
}

/// The registry serves numeric ids; older deployments served strings.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Num(i64),
        Str(String),
    }
    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Num(n) => n.to_string(),
        IdRepr::Str(s) => s,
    })
}

#[async_trait]
pub trait RegistryProvider: Send + Sync + 'static {
    /// Fetch the full remote route list.
    async fn fetch_routes(&self) -> Result<Vec<RemoteRoute>, RegistryError>;

    /// Fetch the current instance set for one service.
    async fn fetch_instances(&self, service_id: &str)
    -> Result<Vec<InstanceRecord>, RegistryError>;
}
