//! Provider Adapter Contract
//!
//! The boundary between the routing core and vendor wire protocols. Adapters translate
//! normalized requests into provider calls and report failures as [`ProviderFailure`]
//! values, which stay opaque until they pass through the classifier.

use crate::api::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::client::rate_limits::RateLimitData;
use crate::vault::Secret;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A successful adapter response plus any rate-limit snapshot from its headers
#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub body: T,
    pub rate_limits: Option<RateLimitData>,
}

impl<T> Completion<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            rate_limits: None,
        }
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimitData) -> Self {
        if !rate_limits.is_empty() {
            self.rate_limits = Some(rate_limits);
        }
        self
    }
}

/// Transport-level failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Dns,
    Reset,
    Other,
}

/// A raw failure reported by an adapter
#[derive(Debug)]
pub enum ProviderFailure {
    /// Non-success HTTP response
    Http {
        status: u16,
        body: String,
        headers: HeaderMap,
    },

    /// Provider-native error code surfaced by an SDK rather than an HTTP status
    Api {
        code: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The request never produced a response
    Transport { kind: TransportKind, message: String },

    /// The adapter does not implement the requested operation
    Unsupported(String),

    /// Anything else
    Other(anyhow::Error),
}

impl ProviderFailure {
    /// HTTP failure without headers
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Connect,
            message: message.into(),
        }
    }

    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderFailure::Http { status, body, .. } => {
                write!(f, "HTTP {}: {}", status, &body[..floor_char_boundary(body, 300)])
            }
            ProviderFailure::Api { code, message, .. } => write!(f, "{}: {}", code, message),
            ProviderFailure::Transport { kind, message } => write!(f, "{:?}: {}", kind, message),
            ProviderFailure::Unsupported(op) => write!(f, "unsupported operation: {}", op),
            ProviderFailure::Other(err) => write!(f, "{}", err),
        }
    }
}

impl From<reqwest::Error> for ProviderFailure {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        let kind = if err.is_timeout() {
            TransportKind::Timeout
        } else if err.is_connect() {
            let lower = format!("{:?}", err).to_lowercase();
            if lower.contains("dns") || lower.contains("resolve") {
                TransportKind::Dns
            } else {
                TransportKind::Connect
            }
        } else if err.is_request() || err.is_body() {
            TransportKind::Reset
        } else if let Some(status) = err.status() {
            return ProviderFailure::http(status.as_u16(), message);
        } else if err.is_decode() {
            return ProviderFailure::Other(anyhow::Error::new(err).context("failed to decode response"));
        } else {
            TransportKind::Other
        };

        ProviderFailure::Transport { kind, message }
    }
}

pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Uniform capability interface every provider adapter implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id this adapter serves (e.g. "openai")
    fn provider_id(&self) -> &str;

    /// Base URL used for probes
    fn base_url(&self) -> &str;

    /// Lightweight health check; returns the provider's current rate-limit snapshot
    async fn probe_health(
        &self,
        secret: &Secret,
        base_url: &str,
    ) -> Result<RateLimitData, ProviderFailure>;

    /// Chat completion
    async fn complete(
        &self,
        secret: &Secret,
        request: &ChatRequest,
    ) -> Result<Completion<ChatResponse>, ProviderFailure>;

    /// Models the key can access
    async fn list_models(&self, secret: &Secret) -> Result<Vec<String>, ProviderFailure>;

    fn supports_embeddings(&self) -> bool {
        false
    }

    async fn embed(
        &self,
        _secret: &Secret,
        _request: &EmbeddingRequest,
    ) -> Result<Completion<EmbeddingResponse>, ProviderFailure> {
        Err(ProviderFailure::Unsupported("embeddings".to_string()))
    }
}

/// Adapter instances keyed by provider id
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same provider
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.adapters.contains_key(provider_id)
    }

    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_truncates_long_bodies() {
        let failure = ProviderFailure::http(500, "x".repeat(1000));
        assert!(failure.to_string().len() < 320);
    }

    #[test]
    fn test_completion_ignores_empty_snapshot() {
        let completion = Completion::new(()).with_rate_limits(RateLimitData::default());
        assert!(completion.rate_limits.is_none());
    }
}
