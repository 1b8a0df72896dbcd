//! Retrieval service client.
//!
//! The retrieval service owns the vector index. This crate only registers
//! models with it and manages dataset lifecycles.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{Model, ModelType};
use crate::error::{BridgeError, Result};

const SERVICE: &str = "retrieval service";

/// A model as known to the retrieval service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagModel {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub model: String,
}

/// Operations consumed from the retrieval service.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn list_models(&self) -> Result<Vec<RagModel>>;

    /// Register a model; returns the service-side id.
    async fn add_model(&self, model: &Model) -> Result<String>;

    /// Replace the model configured for `model.model_type`.
    async fn update_model(&self, model: &Model) -> Result<()>;

    /// Create an empty dataset; returns its id.
    async fn create_dataset(&self) -> Result<String>;

    async fn delete_dataset(&self, dataset_id: &str) -> Result<()>;
}

/// Wire form of a model pushed to the service.
#[derive(Debug, Serialize)]
struct ModelConfig<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    id: &'a str,
    #[serde(rename = "type")]
    model_type: ModelType,
    provider: &'a str,
    model: &'a str,
    base_url: &'a str,
    api_key: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    api_header: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    api_version: &'a str,
    is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a serde_json::Value>,
}

impl<'a> From<&'a Model> for ModelConfig<'a> {
    fn from(m: &'a Model) -> Self {
        Self {
            id: &m.id,
            model_type: m.model_type,
            provider: &m.provider,
            model: &m.model,
            base_url: &m.base_url,
            api_key: &m.api_key,
            api_header: &m.api_header,
            api_version: &m.api_version,
            is_active: m.is_active,
            parameters: m.parameters.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

/// HTTP client for the retrieval service's JSON API.
pub struct HttpRetrievalClient {
    client: Client,
    base_url: String,
}

impl HttpRetrievalClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::upstream(SERVICE, e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|e| BridgeError::upstream(SERVICE, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::upstream(
                SERVICE,
                format!("HTTP {}: {}", status, body),
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl RetrievalService for HttpRetrievalClient {
    async fn list_models(&self) -> Result<Vec<RagModel>> {
        let resp = self.send(self.client.get(self.url("/models"))).await?;
        resp.json().await.map_err(|e| BridgeError::upstream(SERVICE, e))
    }

    async fn add_model(&self, model: &Model) -> Result<String> {
        let body = ModelConfig::from(model);
        let resp = self
            .send(self.client.post(self.url("/models")).json(&body))
            .await?;
        let created: IdResponse = resp.json().await.map_err(|e| BridgeError::upstream(SERVICE, e))?;
        Ok(created.id)
    }

    async fn update_model(&self, model: &Model) -> Result<()> {
        let body = ModelConfig::from(model);
        self.send(self.client.put(self.url("/models")).json(&body))
            .await?;
        Ok(())
    }

    async fn create_dataset(&self) -> Result<String> {
        let resp = self
            .send(self.client.post(self.url("/datasets")).json(&serde_json::json!({})))
            .await?;
        let created: IdResponse = resp.json().await.map_err(|e| BridgeError::upstream(SERVICE, e))?;
        Ok(created.id)
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        let url = self.url(&format!("/datasets/{}", dataset_id));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_config_omits_empty_optionals() {
        let mut model = Model::managed(ModelType::Rerank, "bge-reranker-v2-m3", "https://m", "k");
        model.id = String::new();
        let json = serde_json::to_value(ModelConfig::from(&model)).unwrap();
        assert_eq!(json["type"], "rerank");
        assert_eq!(json["api_key"], "k");
        assert!(json.get("id").is_none());
        assert!(json.get("api_header").is_none());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = HttpRetrievalClient::new("http://rag:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/models"), "http://rag:8080/api/v1/models");
    }
}
