//! keyrelay - Multi-key LLM request router
//!
//! Stores provider keys in an encrypted vault, tracks health per (key, model) pair and
//! serves each logical request from the best available key, failing over until one
//! succeeds or every candidate is exhausted.
//!
//! ```no_run
//! use keyrelay::{ChatRequest, KeyRelay, RelayRequest};
//!
//! # async fn run() -> keyrelay::Result<()> {
//! let relay = KeyRelay::new()?;
//! relay.unlock(None)?;
//! let response = relay
//!     .execute(RelayRequest::chat("chat", ChatRequest::user("Hello")))
//!     .await?;
//! println!("{:?}", response.content());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod ledger;
pub mod locks;
pub mod router;
pub mod store;
pub mod vault;

pub use api::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message, Usage};
pub use client::{
    AdapterRegistry, ClassifiedError, Completion, ErrorKind, OpenAiCompatAdapter, ProviderAdapter,
    ProviderFailure, RateLimitData,
};
pub use config::{ConfigLoader, RelayConfig, RequestOverrides};
pub use context::RelayContext;
pub use error::{RelayError, Result, UnlockError};
pub use health::{ModelAvailability, ModelState, ProbeOutcome, ProbeReport};
pub use ledger::{ErrorLogEntry, HistoryQuery, KeyQuota, UsageDataPoint, UsageSummary};
pub use router::{
    AttemptFailure, Payload, RelayRequest, RelayResponse, ResponseBody, SelectionEngine,
    SkipReason, SkippedCandidate,
};
pub use store::Store;
pub use vault::{KeyFilter, KeyPatch, KeyRecord, Priority, Secret, UnlockMode, VerificationStatus};

use chrono::Utc;
use client::classifier::classify;
use health::{prober, TransitionEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG` (default `keyrelay=info`).
/// Calling it again, or after another subscriber was installed, is a no-op.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keyrelay=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Where the relay keeps its tables
#[derive(Debug, Clone)]
enum StoreLocation {
    Configured,
    Dir(PathBuf),
    Memory,
    Shared(Arc<Store>),
}

/// Builder for [`KeyRelay`]
pub struct KeyRelayBuilder {
    config: Option<RelayConfig>,
    location: StoreLocation,
    adapters: AdapterRegistry,
    default_adapters: bool,
}

impl KeyRelayBuilder {
    fn new() -> Self {
        Self {
            config: None,
            location: StoreLocation::Configured,
            adapters: AdapterRegistry::new(),
            default_adapters: true,
        }
    }

    /// Use this config instead of loading from the default locations
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.location = StoreLocation::Dir(dir.into());
        self
    }

    /// Keep everything in memory; nothing survives the process
    pub fn in_memory(mut self) -> Self {
        self.location = StoreLocation::Memory;
        self
    }

    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.location = StoreLocation::Shared(store);
        self
    }

    /// Register an adapter; it replaces the default adapter for the same provider
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Do not create [`OpenAiCompatAdapter`]s for configured providers
    pub fn without_default_adapters(mut self) -> Self {
        self.default_adapters = false;
        self
    }

    pub fn build(self) -> Result<KeyRelay> {
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => ConfigLoader::new()?.into_config(),
        };

        let store = match self.location {
            StoreLocation::Shared(store) => store,
            StoreLocation::Memory => Arc::new(Store::in_memory()),
            StoreLocation::Dir(dir) => Arc::new(Store::open(dir)?),
            StoreLocation::Configured => {
                let dir = config.vault.resolve_data_dir().ok_or_else(|| {
                    RelayError::Config(
                        "No data directory available. Set vault.data_dir in the config".to_string(),
                    )
                })?;
                Arc::new(Store::open(dir)?)
            }
        };

        let mut adapters = self.adapters;
        if self.default_adapters {
            let mut providers: Vec<_> = config.providers.iter().collect();
            providers.sort_by(|a, b| a.0.cmp(b.0));
            for (provider_id, settings) in providers {
                if !adapters.contains(provider_id) {
                    adapters.register(Arc::new(OpenAiCompatAdapter::new(provider_id.as_str(), settings)?));
                }
            }
        }

        let ctx = Arc::new(RelayContext::open(config, store, adapters)?);
        tracing::debug!(providers = ?ctx.adapters.providers(), "relay ready");
        Ok(KeyRelay {
            engine: SelectionEngine::new(Arc::clone(&ctx)),
            ctx,
        })
    }
}

/// The relay: vault, health tracking, quota ledger and selection engine behind one handle
#[derive(Debug, Clone)]
pub struct KeyRelay {
    ctx: Arc<RelayContext>,
    engine: SelectionEngine,
}

impl KeyRelay {
    /// Create a relay with config from the default locations
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a relay with a custom config path
    pub fn with_config_path(path: &str) -> Result<Self> {
        let loader = ConfigLoader::from_path(path)?;
        Self::builder().config(loader.into_config()).build()
    }

    pub fn builder() -> KeyRelayBuilder {
        KeyRelayBuilder::new()
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    // Requests

    pub async fn execute(&self, request: RelayRequest) -> Result<RelayResponse> {
        self.engine.execute(request).await
    }

    pub async fn execute_with_cancel(
        &self,
        request: RelayRequest,
        cancel: &CancellationToken,
    ) -> Result<RelayResponse> {
        self.engine.execute_with_cancel(request, cancel).await
    }

    // Vault

    /// Unlock with a passphrase, or with the platform key file when `None`.
    /// With `None`, the passphrase variable named in the config is consulted first.
    pub fn unlock(&self, passphrase: Option<&str>) -> Result<()> {
        match passphrase {
            Some(passphrase) => self.ctx.vault.unlock(Some(passphrase)),
            None => {
                let from_env = self.ctx.config.vault.passphrase_from_env();
                self.ctx.vault.unlock(from_env.as_deref())
            }
        }
    }

    pub fn lock(&self) {
        self.ctx.vault.lock();
    }

    pub fn is_unlocked(&self) -> bool {
        self.ctx.vault.is_unlocked()
    }

    pub fn add_key(
        &self,
        provider_id: &str,
        secret: impl Into<Secret>,
        label: &str,
        priority: Priority,
    ) -> Result<KeyRecord> {
        let record = self
            .ctx
            .vault
            .add_key(provider_id, secret.into(), label, priority)?;
        self.ctx.ledger.seed(&record.id, None, Utc::now());
        Ok(record)
    }

    pub fn revoke(&self, key_id: &str) -> Result<KeyRecord> {
        self.ctx.vault.revoke(key_id)
    }

    /// Replace a key's secret. Its model states start over as untested.
    pub async fn rotate_key(&self, key_id: &str, secret: impl Into<Secret>) -> Result<KeyRecord> {
        let secret = secret.into();
        let _guard = self.ctx.locks.lock_key(key_id).await;

        let record = self.ctx.vault.rotate(key_id, secret)?;
        self.ctx.models.transition_key(
            key_id,
            &TransitionEvent::ManualReset,
            Utc::now(),
            &self.ctx.policy,
        )?;
        self.ctx.ledger.remove(key_id);
        self.ctx.sync_key_health(key_id, None)?;
        Ok(record)
    }

    /// Delete a key along with its model metadata and quota
    pub async fn remove_key(&self, key_id: &str) -> Result<KeyRecord> {
        let removed = {
            let _guard = self.ctx.locks.lock_key(key_id).await;
            let removed = self.ctx.vault.remove_key(key_id)?;
            self.ctx.models.remove_key(key_id)?;
            self.ctx.ledger.remove(key_id);
            removed
        };
        self.ctx.locks.forget(key_id);
        Ok(removed)
    }

    /// Enable or disable a key. Re-enabling resets its model states to untested.
    pub async fn set_enabled(&self, key_id: &str, enabled: bool) -> Result<KeyRecord> {
        let patch = KeyPatch {
            is_enabled: Some(enabled),
            ..KeyPatch::default()
        };
        self.update_key(key_id, patch).await
    }

    /// Edit a key's metadata. Enabling a key through the patch resets its model states
    /// the same way [`KeyRelay::set_enabled`] does.
    pub async fn update_key(&self, key_id: &str, patch: KeyPatch) -> Result<KeyRecord> {
        let _guard = self.ctx.locks.lock_key(key_id).await;
        let enabled = patch.is_enabled;
        let record = self.ctx.vault.update_metadata(key_id, patch)?;

        if enabled == Some(true) {
            self.ctx.models.transition_key(
                key_id,
                &TransitionEvent::ManualReset,
                Utc::now(),
                &self.ctx.policy,
            )?;
            self.ctx.sync_key_health(key_id, None)?;
        }
        if let Some(enabled) = enabled {
            tracing::info!(key_id, enabled, "key enablement changed");
        }
        Ok(self.ctx.vault.get(key_id).unwrap_or(record))
    }

    pub fn list_keys(&self, filter: &KeyFilter) -> Vec<KeyRecord> {
        self.ctx.vault.list_keys(filter)
    }

    // Health

    /// Ask the provider which models a key can use and seed metadata for them.
    ///
    /// When the provider config lists models, only those are seeded; otherwise every model
    /// the provider reports is. Returns the seeded model ids.
    pub async fn discover_models(&self, key_id: &str) -> Result<Vec<String>> {
        let record = self
            .ctx
            .vault
            .get(key_id)
            .ok_or_else(|| RelayError::NotFound(key_id.to_string()))?;
        let adapter = self.ctx.adapters.get(&record.provider_id).ok_or_else(|| {
            RelayError::Config(format!("No adapter registered for provider '{}'", record.provider_id))
        })?;

        let secret = self.ctx.vault.decrypt_secret(key_id)?;
        let listed = adapter.list_models(&secret).await;
        drop(secret);

        let listed = listed.map_err(|failure| RelayError::Discovery {
            key_id: key_id.to_string(),
            error: classify(&failure, &record.provider_id, "*"),
        })?;

        let configured = self.ctx.config.provider(&record.provider_id).map(|p| &p.models);
        let seeded: Vec<String> = listed
            .into_iter()
            .filter(|model| configured.map_or(true, |c| c.is_empty() || c.contains(model)))
            .collect();

        let _guard = self.ctx.locks.lock_key(key_id).await;
        for model_id in &seeded {
            self.ctx.ensure_pair(&record, model_id)?;
        }
        tracing::info!(key_id, provider = %record.provider_id, models = seeded.len(), "models discovered");
        Ok(seeded)
    }

    /// Probe every pair that is untested, due for retry or due for re-verification
    pub async fn probe_due(&self) -> Result<Vec<ProbeReport>> {
        prober::probe_due(&self.ctx).await
    }

    /// Probe in the background every `interval` until `token` is cancelled
    pub fn spawn_prober(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        prober::spawn(Arc::clone(&self.ctx), interval, token)
    }

    // Read accessors

    pub fn model_states(&self, key_id: Option<&str>) -> Vec<ModelAvailability> {
        match key_id {
            Some(key_id) => self.ctx.models.for_key(key_id),
            None => self.ctx.models.all(),
        }
    }

    pub fn quota(&self, key_id: &str) -> KeyQuota {
        self.ctx.ledger.get(key_id, Utc::now())
    }

    pub fn usage_history(&self, query: &HistoryQuery) -> Vec<UsageDataPoint> {
        self.ctx.history().usage(query)
    }

    pub fn error_history(&self, query: &HistoryQuery) -> Vec<ErrorLogEntry> {
        self.ctx.history().errors(query)
    }

    pub fn usage_summary(&self, key_id: Option<&str>) -> Vec<UsageSummary> {
        self.ctx.history().usage_summary(key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> KeyRelay {
        let mut config = RelayConfig::default();
        config.vault.kdf_iterations = 1_000;
        KeyRelay::builder()
            .config(config)
            .in_memory()
            .build()
            .unwrap()
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn test_builder_registers_default_adapters() {
        let config = RelayConfig::default().with_provider(
            "openai",
            config::ProviderSettings::new("https://api.openai.com/v1").with_models(["gpt-4o"]),
        );
        let relay = KeyRelay::builder()
            .config(config)
            .in_memory()
            .build()
            .unwrap();
        assert_eq!(relay.context().adapters.providers(), vec!["openai"]);
    }

    #[tokio::test]
    async fn test_remove_key_cascades() {
        let relay = relay();
        relay.unlock(Some("correct horse")).unwrap();
        let record = relay
            .add_key("openai", "sk-remove", "temp", Priority::Medium)
            .unwrap();

        let removed = relay.remove_key(&record.id).await.unwrap();
        assert_eq!(removed.id, record.id);
        assert!(relay.list_keys(&KeyFilter::all().with_revoked()).is_empty());
        assert!(relay.model_states(Some(&record.id)).is_empty());
        assert!(matches!(
            relay.remove_key(&record.id).await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_enabled_round_trip() {
        let relay = relay();
        relay.unlock(Some("correct horse")).unwrap();
        let record = relay
            .add_key("openai", "sk-toggle", "toggle", Priority::High)
            .unwrap();

        let disabled = relay.set_enabled(&record.id, false).await.unwrap();
        assert!(!disabled.is_enabled);
        assert!(relay.list_keys(&KeyFilter::all().usable()).is_empty());

        let enabled = relay.set_enabled(&record.id, true).await.unwrap();
        assert!(enabled.is_enabled);
        assert_eq!(enabled.verification_status, VerificationStatus::Untested);
    }
}
