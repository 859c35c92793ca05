//! Shared relay state
//!
//! Everything the selection engine and the prober touch, owned in one place and passed
//! around as `Arc<RelayContext>`. Outcome bookkeeping lives here so traffic and probes
//! update key, model and quota state the same way.

use crate::api::Usage;
use crate::client::adapter::AdapterRegistry;
use crate::client::classifier::ClassifiedError;
use crate::client::rate_limits::RateLimitData;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::health::{BackoffPolicy, ModelAvailability, ModelRegistry, Transition, TransitionEvent};
use crate::ledger::{ErrorLogEntry, History, LogSource, QuotaLedger, UsageDataPoint};
use crate::locks::KeyLocks;
use crate::store::Store;
use crate::vault::{KeyFilter, KeyRecord, Vault};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug)]
pub struct RelayContext {
    pub(crate) config: RelayConfig,
    pub(crate) vault: Vault,
    pub(crate) models: ModelRegistry,
    pub(crate) ledger: QuotaLedger,
    pub(crate) locks: KeyLocks,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) policy: BackoffPolicy,
}

/// A finished call, ready to be recorded
#[derive(Debug, Clone)]
pub(crate) struct SuccessRecord {
    pub latency_ms: u64,
    pub usage: Option<Usage>,
    pub rate_limits: Option<RateLimitData>,
    pub attempt: u32,
}

impl RelayContext {
    pub(crate) fn open(config: RelayConfig, store: Arc<Store>, adapters: AdapterRegistry) -> Result<Self> {
        let vault = Vault::open(store.clone(), config.vault.kdf_iterations)?;
        let models = ModelRegistry::open(store.clone())?;
        let history = Arc::new(History::open(store)?);
        let ledger = QuotaLedger::new(history);
        let policy = BackoffPolicy::from_settings(&config.engine);

        let now = Utc::now();
        for record in vault.list_keys(&KeyFilter::all()) {
            ledger.seed(&record.id, record.rate_limits.as_ref(), now);
        }

        Ok(Self {
            config,
            vault,
            models,
            ledger,
            locks: KeyLocks::new(),
            adapters,
            policy,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn history(&self) -> &History {
        self.ledger.history()
    }

    /// A key claims a model when it has metadata for it or its provider lists it
    pub fn claims(&self, record: &KeyRecord, model_id: &str) -> bool {
        self.models.contains(&record.id, model_id)
            || self
                .config
                .provider(&record.provider_id)
                .map_or(false, |p| p.serves(model_id))
    }

    /// Models a key claims: configured ones first, then discovered extras
    pub fn claimed_models(&self, record: &KeyRecord) -> Vec<String> {
        let mut models: Vec<String> = self
            .config
            .provider(&record.provider_id)
            .map(|p| p.models.clone())
            .unwrap_or_default();
        for pair in self.models.for_key(&record.id) {
            if !models.contains(&pair.model_id) {
                models.push(pair.model_id);
            }
        }
        models
    }

    /// Fresh metadata for a pair, using configured priority and model facts
    pub(crate) fn seed_for(&self, record: &KeyRecord, model_id: &str) -> ModelAvailability {
        let priority = self.config.model_priority(&record.provider_id, model_id);
        let seed = ModelAvailability::new(&record.id, &record.provider_id, model_id, priority);
        match self
            .config
            .provider(&record.provider_id)
            .and_then(|p| p.model_info.get(model_id))
        {
            Some(info) => seed.with_info(info),
            None => seed,
        }
    }

    pub(crate) fn ensure_pair(&self, record: &KeyRecord, model_id: &str) -> Result<()> {
        self.models.ensure(self.seed_for(record, model_id))?;
        Ok(())
    }

    /// Apply an event to a pair, creating its metadata first if needed
    pub(crate) fn transition(
        &self,
        record: &KeyRecord,
        model_id: &str,
        event: &TransitionEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        self.ensure_pair(record, model_id)?;
        self.models
            .transition(&record.id, model_id, event, now, &self.policy)
    }

    /// Push the key's aggregated model health onto its record
    pub(crate) fn sync_key_health(&self, key_id: &str, retry_after_ms: Option<u64>) -> Result<()> {
        let (status, next_retry_at) = self.models.key_status(key_id);
        self.vault
            .set_health(key_id, status, retry_after_ms, next_retry_at)?;
        Ok(())
    }

    pub(crate) fn apply_rate_limits(&self, key_id: &str, snapshot: &RateLimitData) -> Result<()> {
        self.ledger.apply_rate_limit_snapshot(key_id, snapshot);
        self.models.apply_rate_limits(key_id, snapshot)?;
        self.vault.apply_rate_limits(key_id, snapshot)?;
        Ok(())
    }

    /// Bookkeeping for a successful traffic call
    pub(crate) async fn record_success(
        &self,
        record: &KeyRecord,
        model_id: &str,
        outcome: &SuccessRecord,
    ) -> Result<()> {
        let _guard = self.locks.lock_key(&record.id).await;
        let now = Utc::now();

        self.transition(record, model_id, &TransitionEvent::TrafficSucceeded, now)?;
        self.vault.record_usage(
            &record.id,
            outcome.latency_ms,
            self.config.engine.latency_smoothing,
            now,
        )?;

        let usage = outcome.usage.unwrap_or_default();
        let estimated_cost = self
            .config
            .provider(&record.provider_id)
            .map_or(0.0, |p| {
                p.estimate_cost(model_id, usage.prompt_tokens, usage.completion_tokens)
            });
        self.ledger.record(UsageDataPoint {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            key_id: record.id.clone(),
            provider_id: record.provider_id.clone(),
            model_id: model_id.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            latency_ms: outcome.latency_ms,
            estimated_cost,
            attempt: outcome.attempt,
        })?;

        // The provider's remaining count already includes this call, so its snapshot
        // lands after the local increment and replaces it
        if let Some(snapshot) = &outcome.rate_limits {
            let mut snapshot = snapshot.clone();
            snapshot.captured_at = Some(snapshot.captured_at.map_or(now, |at| at.max(now)));
            self.apply_rate_limits(&record.id, &snapshot)?;
        }

        self.sync_key_health(&record.id, None)
    }

    /// Bookkeeping for a failed call or probe
    pub(crate) async fn record_failure(
        &self,
        record: &KeyRecord,
        model_id: &str,
        error: &ClassifiedError,
        source: LogSource,
        attempt: Option<u32>,
    ) -> Result<Option<Transition>> {
        let _guard = self.locks.lock_key(&record.id).await;
        let now = Utc::now();

        let event = match source {
            LogSource::Traffic => TransitionEvent::TrafficFailed(error.clone()),
            LogSource::Probe => TransitionEvent::ProbeFailed(error.clone()),
        };
        let transition = self.transition(record, model_id, &event, now)?;

        if error.kind.is_transient() {
            tracing::warn!(
                key_id = %record.id,
                provider = %record.provider_id,
                model = model_id,
                kind = %error.kind,
                attempt,
                "{}",
                error.message
            );
        } else {
            tracing::error!(
                key_id = %record.id,
                provider = %record.provider_id,
                model = model_id,
                kind = %error.kind,
                attempt,
                "{}",
                error.message
            );
        }

        self.history().append_error(ErrorLogEntry::new(
            &record.id,
            &record.provider_id,
            model_id,
            error,
            source,
            attempt,
        ))?;
        self.sync_key_health(&record.id, error.retry_after_ms)?;
        Ok(transition)
    }
}
