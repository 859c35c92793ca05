//! Background Probing
//!
//! Verifies (key, model) pairs that are untested, due for retry, or stale. Probes run
//! concurrently up to `probe_concurrency`; a pair already being probed is skipped.

use crate::client::adapter::ProviderFailure;
use crate::client::classifier::{classify, ClassifiedError};
use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::health::machine::{ModelState, TransitionEvent};
use crate::ledger::LogSource;
use crate::vault::KeyFilter;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Available,
    Failed(ClassifiedError),
    /// Not probed: already in flight, not due, or the key is unusable
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub key_id: String,
    pub model_id: String,
    pub outcome: ProbeOutcome,
    /// State after the probe, when the pair has metadata
    pub state: Option<ModelState>,
}

impl ProbeReport {
    fn skipped(key_id: &str, model_id: &str, reason: impl Into<String>) -> Self {
        Self {
            key_id: key_id.to_string(),
            model_id: model_id.to_string(),
            outcome: ProbeOutcome::Skipped(reason.into()),
            state: None,
        }
    }
}

/// Pairs that should be probed at `now`, in key insertion order
pub fn due_pairs(ctx: &RelayContext, now: DateTime<Utc>) -> Vec<(String, String)> {
    let reverify_after = ctx
        .config
        .engine
        .reverify_after_secs
        .map(|secs| chrono::Duration::seconds(secs as i64));

    let mut due = Vec::new();
    for record in ctx.vault.list_keys(&KeyFilter::all().usable()) {
        if !ctx.adapters.contains(&record.provider_id) {
            continue;
        }
        for model_id in ctx.claimed_models(&record) {
            let is_due = match ctx.models.get(&record.id, &model_id) {
                None => true,
                Some(pair) => match pair.state {
                    ModelState::Untested | ModelState::Probing => true,
                    ModelState::CoolingDown => pair.can_probe(now),
                    ModelState::Available => match (reverify_after, pair.last_checked_at) {
                        (Some(window), Some(checked)) => checked + window <= now,
                        (Some(_), None) => true,
                        (None, _) => false,
                    },
                    ModelState::Unavailable | ModelState::PermanentlyDisabled => false,
                },
            };
            if is_due {
                due.push((record.id.clone(), model_id));
            }
        }
    }
    due
}

/// Probe every due pair once
pub async fn probe_due(ctx: &Arc<RelayContext>) -> Result<Vec<ProbeReport>> {
    if !ctx.vault.is_unlocked() {
        return Err(RelayError::LockedVault);
    }

    let pairs = due_pairs(ctx, Utc::now());
    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    tracing::debug!(pairs = pairs.len(), "probing due pairs");

    let concurrency = ctx.config.engine.probe_concurrency.max(1);
    let results: Vec<Result<ProbeReport>> = stream::iter(pairs)
        .map(|(key_id, model_id)| {
            let ctx = Arc::clone(ctx);
            async move { probe_pair(&ctx, &key_id, &model_id).await }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    results.into_iter().collect()
}

/// Probe a single pair
pub async fn probe_pair(ctx: &RelayContext, key_id: &str, model_id: &str) -> Result<ProbeReport> {
    let Some(_slot) = ctx.locks.try_probe(key_id, model_id) else {
        return Ok(ProbeReport::skipped(key_id, model_id, "probe already running"));
    };

    let Some(record) = ctx.vault.get(key_id).filter(|r| r.is_usable()) else {
        return Ok(ProbeReport::skipped(key_id, model_id, "key is not usable"));
    };
    let Some(adapter) = ctx.adapters.get(&record.provider_id) else {
        return Ok(ProbeReport::skipped(key_id, model_id, "no adapter for provider"));
    };

    let secret = match ctx.vault.decrypt_secret(key_id) {
        Ok(secret) => secret,
        Err(RelayError::CorruptKey { .. }) | Err(RelayError::NotFound(_)) => {
            return Ok(ProbeReport::skipped(key_id, model_id, "key could not be decrypted"));
        }
        Err(e) => return Err(e),
    };

    {
        let _guard = ctx.locks.lock_key(key_id).await;
        let started = ctx.transition(&record, model_id, &TransitionEvent::ProbeStarted, Utc::now())?;
        if !started.map_or(false, |t| t.applied) {
            return Ok(ProbeReport::skipped(key_id, model_id, "pair is not due"));
        }
        ctx.sync_key_health(key_id, None)?;
    }

    let base_url = ctx
        .config
        .provider(&record.provider_id)
        .map(|p| p.get_base_url())
        .unwrap_or_else(|| adapter.base_url().to_string());
    let timeout = ctx.config.engine.probe_timeout();

    let result = match tokio::time::timeout(timeout, adapter.probe_health(&secret, &base_url)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderFailure::timeout(format!(
            "probe timed out after {}ms",
            timeout.as_millis()
        ))),
    };
    drop(secret);

    match result {
        Ok(snapshot) => {
            let _guard = ctx.locks.lock_key(key_id).await;
            if !snapshot.is_empty() {
                ctx.apply_rate_limits(key_id, &snapshot)?;
            }
            ctx.transition(&record, model_id, &TransitionEvent::ProbeSucceeded, Utc::now())?;
            ctx.sync_key_health(key_id, None)?;
            tracing::info!(key_id, provider = %record.provider_id, model = model_id, "probe succeeded");

            Ok(ProbeReport {
                key_id: key_id.to_string(),
                model_id: model_id.to_string(),
                outcome: ProbeOutcome::Available,
                state: ctx.models.get(key_id, model_id).map(|m| m.state),
            })
        }
        Err(failure) => {
            let error = classify(&failure, &record.provider_id, model_id);
            ctx.record_failure(&record, model_id, &error, LogSource::Probe, None)
                .await?;

            Ok(ProbeReport {
                key_id: key_id.to_string(),
                model_id: model_id.to_string(),
                outcome: ProbeOutcome::Failed(error),
                state: ctx.models.get(key_id, model_id).map(|m| m.state),
            })
        }
    }
}

/// Run `probe_due` every `interval` until `token` is cancelled
pub fn spawn(ctx: Arc<RelayContext>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A round is never interrupted mid-probe; each probe is bounded by its timeout
            match probe_due(&ctx).await {
                Ok(reports) if !reports.is_empty() => {
                    tracing::debug!(probed = reports.len(), "probe round finished");
                }
                Ok(_) => {}
                Err(RelayError::LockedVault) => {
                    tracing::debug!("vault locked, skipping probe round");
                }
                Err(e) => tracing::warn!(error = %e, "probe round failed"),
            }
        }

        tracing::debug!("prober stopped");
    })
}
