//! Selection Engine
//!
//! Resolves a logical request into candidates, filters and orders them, then tries them one
//! at a time until one succeeds. Failures are classified and recorded before moving on.

use crate::api::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Usage};
use crate::client::adapter::{ProviderAdapter, ProviderFailure};
use crate::client::classifier::classify;
use crate::client::rate_limits::RateLimitData;
use crate::config::RequestOverrides;
use crate::context::{RelayContext, SuccessRecord};
use crate::error::{RelayError, Result};
use crate::ledger::LogSource;
use crate::router::candidates::{
    sort_candidates, AttemptFailure, Candidate, SkipReason, SkippedCandidate,
};
use crate::router::strategy::{resolve, ResolvedTarget};
use crate::vault::{KeyFilter, KeyRecord, Secret};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What the caller wants done
#[derive(Debug, Clone)]
pub enum Payload {
    Chat(ChatRequest),
    Embedding(EmbeddingRequest),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Chat(_) => "chat",
            Payload::Embedding(_) => "embedding",
        }
    }
}

/// A logical request: a target name plus a payload
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Capability, alias or model id (optionally `provider/model`)
    pub target: String,
    pub payload: Payload,
    pub overrides: RequestOverrides,
    /// Per-attempt timeout; defaults to the engine's request timeout
    pub timeout: Option<Duration>,
}

impl RelayRequest {
    pub fn chat(target: impl Into<String>, request: ChatRequest) -> Self {
        Self {
            target: target.into(),
            payload: Payload::Chat(request),
            overrides: RequestOverrides::default(),
            timeout: None,
        }
    }

    pub fn embedding(target: impl Into<String>, request: EmbeddingRequest) -> Self {
        Self {
            target: target.into(),
            payload: Payload::Embedding(request),
            overrides: RequestOverrides::default(),
            timeout: None,
        }
    }

    pub fn with_overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Chat(ChatResponse),
    Embedding(EmbeddingResponse),
}

/// A served request
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub body: ResponseBody,
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,
    /// Adapter calls made, including the successful one
    pub attempts: u32,
    pub latency_ms: u64,
    pub usage: Option<Usage>,
    /// Earlier attempts that failed
    pub failures: Vec<AttemptFailure>,
    pub skipped: Vec<SkippedCandidate>,
}

impl RelayResponse {
    pub fn chat(&self) -> Option<&ChatResponse> {
        match &self.body {
            ResponseBody::Chat(response) => Some(response),
            ResponseBody::Embedding(_) => None,
        }
    }

    pub fn embedding(&self) -> Option<&EmbeddingResponse> {
        match &self.body {
            ResponseBody::Embedding(response) => Some(response),
            ResponseBody::Chat(_) => None,
        }
    }

    /// First choice's text for chat responses
    pub fn content(&self) -> Option<String> {
        self.chat().and_then(ChatResponse::content)
    }
}

struct CallOutcome {
    body: ResponseBody,
    usage: Option<Usage>,
    rate_limits: Option<RateLimitData>,
}

#[derive(Debug, Clone)]
pub struct SelectionEngine {
    ctx: Arc<RelayContext>,
}

impl SelectionEngine {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self, request: RelayRequest) -> Result<RelayResponse> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Execute, aborting the in-flight attempt when `cancel` fires. Nothing is recorded for
    /// the aborted attempt and no further candidates are tried.
    pub async fn execute_with_cancel(
        &self,
        request: RelayRequest,
        cancel: &CancellationToken,
    ) -> Result<RelayResponse> {
        let ctx = &self.ctx;
        if !ctx.vault.is_unlocked() {
            return Err(RelayError::LockedVault);
        }

        let resolved = resolve(&request.target, &ctx.config, &request.overrides, |p| {
            ctx.adapters.contains(p) || ctx.config.providers.contains_key(p)
        })?;

        let (mut candidates, mut skipped) = self.candidates(&resolved, &request.payload);
        if candidates.is_empty() && skipped.is_empty() {
            tracing::warn!(target_name = %resolved.target, "no keys claim any resolved model");
            return Err(RelayError::NoCandidates {
                target: resolved.target,
            });
        }
        sort_candidates(&mut candidates);

        let timeout = request
            .timeout
            .unwrap_or_else(|| ctx.config.engine.request_timeout());
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut attempts: u32 = 0;

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled { attempts });
            }

            // State may have moved since filtering (another request, a probe)
            if let Some(pair) = ctx.models.get(&candidate.key_id, &candidate.model_id) {
                if !pair.is_selectable(Utc::now()) {
                    skipped.push(SkippedCandidate::new(
                        &candidate,
                        SkipReason::from_state(pair.state, pair.next_retry_at),
                    ));
                    continue;
                }
            }

            let Some(record) = ctx.vault.get(&candidate.key_id).filter(KeyRecord::is_usable) else {
                skipped.push(SkippedCandidate::new(&candidate, SkipReason::KeyRemoved));
                continue;
            };
            let Some(adapter) = ctx.adapters.get(&candidate.provider_id) else {
                skipped.push(SkippedCandidate::new(&candidate, SkipReason::NoAdapter));
                continue;
            };

            let secret = match ctx.vault.decrypt_secret(&candidate.key_id) {
                Ok(secret) => secret,
                Err(RelayError::CorruptKey { .. }) => {
                    skipped.push(SkippedCandidate::new(&candidate, SkipReason::CorruptKey));
                    continue;
                }
                Err(RelayError::NotFound(_)) => {
                    skipped.push(SkippedCandidate::new(&candidate, SkipReason::KeyRemoved));
                    continue;
                }
                Err(e) => return Err(e),
            };

            attempts += 1;
            tracing::info!(
                attempt = attempts,
                key_id = %candidate.key_id,
                provider = %candidate.provider_id,
                model = %candidate.model_id,
                "relay attempt"
            );

            let started = Instant::now();
            let call = call_adapter(adapter.as_ref(), &secret, &request.payload, &candidate.model_id);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(attempt = attempts, "request cancelled");
                    return Err(RelayError::Cancelled { attempts });
                }
                result = tokio::time::timeout(timeout, call) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ProviderFailure::timeout(format!(
                        "no response within {}ms",
                        timeout.as_millis()
                    ))),
                },
            };
            drop(secret);
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    ctx.record_success(
                        &record,
                        &candidate.model_id,
                        &SuccessRecord {
                            latency_ms,
                            usage: outcome.usage,
                            rate_limits: outcome.rate_limits,
                            attempt: attempts,
                        },
                    )
                    .await?;

                    tracing::info!(
                        attempt = attempts,
                        key_id = %candidate.key_id,
                        model = %candidate.model_id,
                        latency_ms,
                        "relay succeeded"
                    );
                    return Ok(RelayResponse {
                        body: outcome.body,
                        key_id: candidate.key_id,
                        provider_id: candidate.provider_id,
                        model_id: candidate.model_id,
                        attempts,
                        latency_ms,
                        usage: outcome.usage,
                        failures,
                        skipped,
                    });
                }
                Err(failure) => {
                    let error = classify(&failure, &candidate.provider_id, &candidate.model_id);
                    ctx.record_failure(
                        &record,
                        &candidate.model_id,
                        &error,
                        LogSource::Traffic,
                        Some(attempts),
                    )
                    .await?;

                    failures.push(AttemptFailure {
                        attempt: attempts,
                        key_id: candidate.key_id,
                        provider_id: candidate.provider_id,
                        model_id: candidate.model_id,
                        error,
                    });
                }
            }
        }

        tracing::warn!(
            target_name = %resolved.target,
            failed = failures.len(),
            skipped = skipped.len(),
            "all candidates exhausted"
        );
        Err(RelayError::Exhausted {
            target: resolved.target,
            failures,
            skipped,
        })
    }

    /// Enumerate claiming pairs, splitting them into eligible candidates and skips
    fn candidates(
        &self,
        resolved: &ResolvedTarget,
        payload: &Payload,
    ) -> (Vec<Candidate>, Vec<SkippedCandidate>) {
        let ctx = &self.ctx;
        let now = Utc::now();
        let keys = ctx.vault.list_keys(&KeyFilter::all().usable());

        let mut candidates = Vec::new();
        let mut skipped = Vec::new();
        let mut order = 0;

        for route in &resolved.routes {
            for record in &keys {
                if !route.accepts_provider(&record.provider_id) || !ctx.claims(record, &route.model) {
                    continue;
                }
                let adapter = ctx.adapters.get(&record.provider_id);
                if matches!(payload, Payload::Embedding(_))
                    && adapter.as_ref().map_or(false, |a| !a.supports_embeddings())
                {
                    continue;
                }

                let metadata = ctx.models.get(&record.id, &route.model);
                let candidate = Candidate {
                    key_id: record.id.clone(),
                    provider_id: record.provider_id.clone(),
                    model_id: route.model.clone(),
                    key_priority: record.priority,
                    model_priority: metadata
                        .as_ref()
                        .map(|m| m.model_priority)
                        .unwrap_or_else(|| ctx.config.model_priority(&record.provider_id, &route.model)),
                    average_latency: record.average_latency,
                    remaining: ctx.ledger.remaining(&record.id, now),
                    order,
                };
                order += 1;

                if adapter.is_none() {
                    skipped.push(SkippedCandidate::new(&candidate, SkipReason::NoAdapter));
                } else if let Some(pair) = metadata.filter(|m| !m.is_selectable(now)) {
                    skipped.push(SkippedCandidate::new(
                        &candidate,
                        SkipReason::from_state(pair.state, pair.next_retry_at),
                    ));
                } else if !ctx.ledger.has_headroom(&record.id, now) {
                    skipped.push(SkippedCandidate::new(&candidate, SkipReason::NoHeadroom));
                } else {
                    candidates.push(candidate);
                }
            }
        }

        tracing::debug!(
            payload = payload.kind(),
            eligible = candidates.len(),
            skipped = skipped.len(),
            "enumerated candidates"
        );
        (candidates, skipped)
    }
}

async fn call_adapter(
    adapter: &dyn ProviderAdapter,
    secret: &Secret,
    payload: &Payload,
    model_id: &str,
) -> std::result::Result<CallOutcome, ProviderFailure> {
    match payload {
        Payload::Chat(request) => {
            let completion = adapter.complete(secret, &request.for_model(model_id)).await?;
            Ok(CallOutcome {
                usage: completion.body.usage,
                rate_limits: completion.rate_limits,
                body: ResponseBody::Chat(completion.body),
            })
        }
        Payload::Embedding(request) => {
            let completion = adapter.embed(secret, &request.for_model(model_id)).await?;
            Ok(CallOutcome {
                usage: completion.body.usage,
                rate_limits: completion.rate_limits,
                body: ResponseBody::Embedding(completion.body),
            })
        }
    }
}
