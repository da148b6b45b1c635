//! ServiceAtlas registry adapter over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::ports::registry::{InstanceRecord, RegistryError, RegistryProvider, RemoteRoute};

/// Polling client for the ServiceAtlas route and instance endpoints.
pub struct AtlasRegistryClient {
    base_url: String,
    gateway_id: String,
    client: Client,
}

impl AtlasRegistryClient {
    pub fn new(base_url: &str, gateway_id: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            gateway_id: gateway_id.to_string(),
            client,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, RegistryError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-Gateway-ID", &self.gateway_id)
            .send()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RegistryProvider for AtlasRegistryClient {
    async fn fetch_routes(&self) -> Result<Vec<RemoteRoute>, RegistryError> {
        self.get_json("/api/v1/gateway/routes").await
    }

    async fn fetch_instances(
        &self,
        service_id: &str,
    ) -> Result<Vec<InstanceRecord>, RegistryError> {
        self.get_json(&format!("/api/v1/services/{service_id}/instances"))
            .await
    }
}
