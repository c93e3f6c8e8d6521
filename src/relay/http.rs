//! HTTP relay client

use super::{RelayClient, RelayDevice};
use crate::config::RelayConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use director_shared::CommandRequest;
use serde::Deserialize;
use serde_json::json;

/// Basic-auth user name the relay expects alongside the API key
const RELAY_USER: &str = "micromdm";

#[derive(Deserialize)]
struct EnqueueResponse {
    payload: EnqueuedPayload,
}

#[derive(Deserialize)]
struct EnqueuedPayload {
    command_uuid: String,
}

#[derive(Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<RelayDevice>,
}

/// Relay reached over its JSON API
#[derive(Clone)]
pub struct HttpRelay {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building relay HTTP client")?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(RELAY_USER, Some(&self.api_key))
            .json(body)
            .send()
            .await
            .with_context(|| format!("relay request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("relay answered {} on {}: {}", status, path, body));
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("invalid relay response from {}", path))
    }
}

#[async_trait]
impl RelayClient for HttpRelay {
    async fn enqueue(&self, request: &CommandRequest) -> Result<String> {
        let body = serde_json::to_value(request)?;
        let response: EnqueueResponse = self.post("/v1/commands", &body).await?;
        Ok(response.payload.command_uuid)
    }

    async fn list_devices(&self) -> Result<Vec<RelayDevice>> {
        let response: DevicesResponse = self.post("/v1/devices", &json!({})).await?;
        Ok(response.devices)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
