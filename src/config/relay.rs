//! Relay Configuration
//!
//! Process-wide routing configuration: alias table, capability overrides, fallback
//! chains, plus engine and vault tuning.

use crate::config::provider::ProviderSettings;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Provider settings keyed by provider id
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    /// Capability overrides: capability -> preferred model, tried before the chain
    #[serde(default)]
    pub model_types: HashMap<String, String>,

    /// Alias table: alias -> concrete model id
    #[serde(default)]
    pub special_models: HashMap<String, String>,

    /// Ordered fallback chain per capability group
    #[serde(default)]
    pub fallback_chains: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub vault: VaultSettings,
}

/// Selection engine and prober tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Timeout for each traffic attempt
    pub request_timeout_ms: u64,

    /// Timeout for each probe
    pub probe_timeout_ms: u64,

    /// Server/Network/Unknown failures tolerated before a pair is disabled
    pub max_transient_failures: u32,

    /// Probes allowed in flight at once
    pub probe_concurrency: usize,

    /// Re-verify available pairs checked longer ago than this
    pub reverify_after_secs: Option<u64>,

    /// Weight of the newest sample in the latency moving average
    pub latency_smoothing: f64,

    /// Priority for models without an explicit one
    pub default_model_priority: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            probe_timeout_ms: 15_000,
            max_transient_failures: 5,
            probe_concurrency: 4,
            reverify_after_secs: None,
            latency_smoothing: 0.2,
            default_model_priority: 3,
        }
    }
}

impl EngineSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Vault storage and key derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Where the vault files live (default: <data_dir>/keyrelay)
    pub data_dir: Option<PathBuf>,

    /// PBKDF2 iterations for passphrase mode
    pub kdf_iterations: u32,

    /// Environment variable read for the passphrase when none is passed explicitly
    pub passphrase_env: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            kdf_iterations: 100_000,
            passphrase_env: "KEYRELAY_PASSPHRASE".to_string(),
        }
    }
}

impl VaultSettings {
    pub fn resolve_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("keyrelay")))
    }

    /// Passphrase from the configured environment variable, if set
    pub fn passphrase_from_env(&self) -> Option<String> {
        std::env::var(&self.passphrase_env)
            .ok()
            .filter(|p| !p.is_empty())
    }
}

/// Per-request overrides layered over [`RelayConfig`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOverrides {
    #[serde(default)]
    pub model_types: HashMap<String, String>,

    #[serde(default)]
    pub special_models: HashMap<String, String>,

    #[serde(default)]
    pub fallback_chains: HashMap<String, Vec<String>>,
}

impl RequestOverrides {
    pub fn is_empty(&self) -> bool {
        self.model_types.is_empty() && self.special_models.is_empty() && self.fallback_chains.is_empty()
    }
}

impl RelayConfig {
    pub fn provider(&self, provider_id: &str) -> Option<&ProviderSettings> {
        self.providers.get(provider_id)
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>, settings: ProviderSettings) -> Self {
        self.providers.insert(provider_id.into(), settings);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.special_models.insert(alias.into(), model_id.into());
        self
    }

    pub fn with_chain<I, S>(mut self, capability: impl Into<String>, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_chains
            .insert(capability.into(), models.into_iter().map(Into::into).collect());
        self
    }

    /// Effective priority (1-5) of a model served by a provider
    pub fn model_priority(&self, provider_id: &str, model_id: &str) -> u8 {
        self.provider(provider_id)
            .and_then(|p| p.model_priority(model_id))
            .unwrap_or(self.engine.default_model_priority)
            .clamp(1, 5)
    }

    /// Reject configurations the engine cannot route with
    pub fn validate(&self) -> Result<()> {
        for (capability, chain) in &self.fallback_chains {
            if chain.is_empty() {
                return Err(RelayError::Config(format!(
                    "Fallback chain for '{}' is empty",
                    capability
                )));
            }
        }

        for (alias, target) in &self.special_models {
            if target.trim().is_empty() {
                return Err(RelayError::Config(format!("Alias '{}' has no target model", alias)));
            }
        }

        for (provider_id, provider) in &self.providers {
            if provider.base_url.trim().is_empty() {
                return Err(RelayError::Config(format!("Provider '{}' has no base_url", provider_id)));
            }
            for (model, priority) in &provider.model_priorities {
                if !(1..=5).contains(priority) {
                    return Err(RelayError::Config(format!(
                        "Priority {} for '{}/{}' is outside 1-5",
                        priority, provider_id, model
                    )));
                }
            }
        }

        if self.engine.request_timeout_ms == 0 || self.engine.probe_timeout_ms == 0 {
            return Err(RelayError::Config("Timeouts must be greater than zero".to_string()));
        }
        if self.engine.probe_concurrency == 0 {
            return Err(RelayError::Config("probe_concurrency must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.engine.latency_smoothing) {
            return Err(RelayError::Config("latency_smoothing must be within 0-1".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_relay_config() {
        let json = r#"{
            "providers": {
                "openai": { "base_url": "https://api.openai.com/v1", "models": ["gpt-4o-mini"] }
            },
            "special_models": { "fast": "gpt-4o-mini" },
            "fallback_chains": { "chat": ["gpt-4o", "gpt-4o-mini"] },
            "engine": { "request_timeout_ms": 1000 }
        }"#;

        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.special_models.get("fast").unwrap(), "gpt-4o-mini");
        assert_eq!(config.fallback_chains["chat"].len(), 2);
        assert_eq!(config.engine.request_timeout_ms, 1000);
        assert_eq!(config.engine.max_transient_failures, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_chain() {
        let config = RelayConfig::default().with_chain("chat", Vec::<String>::new());
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_priority() {
        let mut provider = ProviderSettings::new("https://api.example.com");
        provider.model_priorities.insert("m".to_string(), 9);
        let config = RelayConfig::default().with_provider("example", provider);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_priority_falls_back_to_default() {
        let mut provider = ProviderSettings::new("https://api.example.com");
        provider.model_priorities.insert("m".to_string(), 5);
        let config = RelayConfig::default().with_provider("example", provider);

        assert_eq!(config.model_priority("example", "m"), 5);
        assert_eq!(config.model_priority("example", "other"), 3);
        assert_eq!(config.model_priority("missing", "m"), 3);
    }
}
