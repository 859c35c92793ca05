//! OpenAI-compatible HTTP Adapter
//!
//! Speaks the `/chat/completions`, `/embeddings` and `/models` endpoints most providers
//! expose. Non-success responses are returned as [`ProviderFailure::Http`] with headers
//! intact so the classifier can read retry hints.

use crate::api::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::client::adapter::{floor_char_boundary, Completion, ProviderAdapter, ProviderFailure};
use crate::client::rate_limits::RateLimitData;
use crate::config::{ProviderSettings, RateLimitHeaders};
use crate::error::{RelayError, Result};
use crate::vault::Secret;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Adapter for providers with an OpenAI-style REST surface
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    provider_id: String,
    base_url: String,
    headers: HeaderMap,
    rate_limit: RateLimitHeaders,
    embeddings: bool,
    client: Client,
}

impl OpenAiCompatAdapter {
    /// Build an adapter from provider settings
    pub fn new(provider_id: impl Into<String>, settings: &ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::Config(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RelayError::Config(format!("Invalid header value for '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        Ok(Self {
            provider_id: provider_id.into(),
            base_url: settings.get_base_url().trim_end_matches('/').to_string(),
            headers,
            rate_limit: settings.rate_limit.clone(),
            embeddings: true,
            client,
        })
    }

    /// Disable the embeddings endpoint for providers that lack one
    pub fn without_embeddings(mut self) -> Self {
        self.embeddings = false;
        self
    }

    fn url(base_url: &str, path: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }

    fn auth_headers(&self, secret: &Secret) -> std::result::Result<HeaderMap, ProviderFailure> {
        let mut headers = self.headers.clone();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", secret.expose_secret()))
            .map_err(|_| ProviderFailure::http(401, "API key contains invalid header characters"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    async fn post<T, R>(
        &self,
        path: &str,
        secret: &Secret,
        body: &T,
    ) -> std::result::Result<Completion<R>, ProviderFailure>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(Self::url(&self.base_url, path))
            .headers(self.auth_headers(secret)?)
            .json(body)
            .send()
            .await?;

        let snapshot = RateLimitData::from_headers(response.headers(), &self.rate_limit, Utc::now());
        let body: R = decode(check_status(response).await?).await?;
        Ok(Completion::new(body).with_rate_limits(snapshot))
    }

    async fn get(
        &self,
        base_url: &str,
        path: &str,
        secret: &Secret,
    ) -> std::result::Result<(RateLimitData, Response), ProviderFailure> {
        let response = self
            .client
            .get(Self::url(base_url, path))
            .headers(self.auth_headers(secret)?)
            .send()
            .await?;

        let snapshot = RateLimitData::from_headers(response.headers(), &self.rate_limit, Utc::now());
        Ok((snapshot, check_status(response).await?))
    }
}

/// Turn a non-success response into a failure carrying its status, body and headers
async fn check_status(response: Response) -> std::result::Result<Response, ProviderFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderFailure::Http {
        status: status.as_u16(),
        body,
        headers,
    })
}

async fn decode<R: DeserializeOwned>(response: Response) -> std::result::Result<R, ProviderFailure> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        ProviderFailure::Other(anyhow::anyhow!(
            "Failed to parse response: {}. Body: {}",
            e,
            &text[..floor_char_boundary(&text, 500)]
        ))
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn probe_health(
        &self,
        secret: &Secret,
        base_url: &str,
    ) -> std::result::Result<RateLimitData, ProviderFailure> {
        let (snapshot, _) = self.get(base_url, "models", secret).await?;
        Ok(snapshot)
    }

    async fn complete(
        &self,
        secret: &Secret,
        request: &ChatRequest,
    ) -> std::result::Result<Completion<ChatResponse>, ProviderFailure> {
        self.post("chat/completions", secret, request).await
    }

    async fn list_models(&self, secret: &Secret) -> std::result::Result<Vec<String>, ProviderFailure> {
        let (_, response) = self.get(&self.base_url, "models", secret).await?;
        let list: ModelList = decode(response).await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    fn supports_embeddings(&self) -> bool {
        self.embeddings
    }

    async fn embed(
        &self,
        secret: &Secret,
        request: &EmbeddingRequest,
    ) -> std::result::Result<Completion<EmbeddingResponse>, ProviderFailure> {
        if !self.embeddings {
            return Err(ProviderFailure::Unsupported("embeddings".to_string()));
        }
        self.post("embeddings", secret, request).await
    }
}
