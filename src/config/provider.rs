//! Provider Configuration
//!
//! Per-provider settings: endpoints, the models each provider serves, rate-limit header
//! names and pricing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL for the API
    pub base_url: String,

    /// Optional environment variable for custom base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_env: Option<String>,

    /// Models served by this provider; a key of this provider claims them before any probe
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Model priority (1-5, higher is preferred)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_priorities: HashMap<String, u8>,

    /// Static model facts copied into model metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_info: HashMap<String, ModelInfo>,

    /// Additional headers to send with requests
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Rate limit header names
    #[serde(default)]
    pub rate_limit: RateLimitHeaders,

    /// Pricing per model, USD per 1K tokens
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pricing: HashMap<String, ModelPricing>,
}

/// Header names a provider uses for rate limit reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitHeaders {
    pub limit_requests: String,
    pub remaining_requests: String,
    pub limit_tokens: String,
    pub remaining_tokens: String,
    pub reset_requests: String,
    pub reset_tokens: String,

    /// Custom header name for retry-after (default: "retry-after")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self {
            limit_requests: "x-ratelimit-limit-requests".to_string(),
            remaining_requests: "x-ratelimit-remaining-requests".to_string(),
            limit_tokens: "x-ratelimit-limit-tokens".to_string(),
            remaining_tokens: "x-ratelimit-remaining-tokens".to_string(),
            reset_requests: "x-ratelimit-reset-requests".to_string(),
            reset_tokens: "x-ratelimit-reset-tokens".to_string(),
            retry_after: None,
            tier: None,
        }
    }
}

/// Static facts about a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output: Option<u32>,
}

/// Token pricing, USD per 1K tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_1k: f64,

    #[serde(default)]
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

impl ProviderSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_base_env: None,
            models: Vec::new(),
            model_priorities: HashMap::new(),
            model_info: HashMap::new(),
            headers: HashMap::new(),
            rate_limit: RateLimitHeaders::default(),
            pricing: HashMap::new(),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Get the effective base URL (from env var if configured, otherwise default)
    pub fn get_base_url(&self) -> String {
        if let Some(env_var) = &self.api_base_env {
            if let Ok(url) = std::env::var(env_var) {
                return url;
            }
        }
        self.base_url.clone()
    }

    pub fn serves(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m == model_id)
    }

    pub fn model_priority(&self, model_id: &str) -> Option<u8> {
        self.model_priorities.get(model_id).copied()
    }

    pub fn estimate_cost(&self, model_id: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.pricing
            .get(model_id)
            .map(|p| p.cost(prompt_tokens, completion_tokens))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_provider_settings() {
        let json = r#"{
            "base_url": "https://api.example.com/v1",
            "models": ["model-a", "model-b"],
            "model_priorities": { "model-a": 5 },
            "rate_limit": { "remaining_requests": "x-remaining" },
            "pricing": { "model-a": { "input_per_1k": 0.5, "output_per_1k": 1.5 } }
        }"#;

        let settings: ProviderSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.base_url, "https://api.example.com/v1");
        assert!(settings.serves("model-b"));
        assert_eq!(settings.model_priority("model-a"), Some(5));
        assert_eq!(settings.rate_limit.remaining_requests, "x-remaining");
        assert_eq!(settings.rate_limit.limit_requests, "x-ratelimit-limit-requests");
    }

    #[test]
    fn test_estimate_cost() {
        let mut settings = ProviderSettings::new("https://api.example.com");
        settings.pricing.insert(
            "model-a".to_string(),
            ModelPricing {
                input_per_1k: 1.0,
                output_per_1k: 2.0,
            },
        );

        let cost = settings.estimate_cost("model-a", 500, 1000);
        assert!((cost - 2.5).abs() < 1e-9);
        assert_eq!(settings.estimate_cost("unpriced", 500, 1000), 0.0);
    }
}
