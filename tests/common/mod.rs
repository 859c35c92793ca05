//! Shared fixtures: a scripted in-process adapter and relay builders.

#![allow(dead_code)]

use async_trait::async_trait;
use keyrelay::config::ProviderSettings;
use keyrelay::{
    ChatRequest, ChatResponse, Completion, EmbeddingRequest, EmbeddingResponse, KeyRelay,
    ProviderAdapter, ProviderFailure, RateLimitData, RelayConfig, Secret, Usage,
};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// One scripted reply
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    /// Success carrying the provider's request quota
    OkWithQuota { limit: u64, remaining: u64 },
    Status(u16),
    RateLimited { retry_after_secs: u64 },
    /// Never answers within any reasonable timeout
    Hang,
}

impl Step {
    async fn run(self) -> Result<Option<RateLimitData>, ProviderFailure> {
        match self {
            Step::Ok => Ok(None),
            Step::OkWithQuota { limit, remaining } => Ok(Some(RateLimitData {
                requests_limit: Some(limit),
                requests_remaining: Some(remaining),
                captured_at: Some(chrono::Utc::now()),
                ..RateLimitData::default()
            })),
            Step::Status(status) => Err(ProviderFailure::http(
                status,
                format!(r#"{{"error":{{"message":"scripted {}"}}}}"#, status),
            )),
            Step::RateLimited { retry_after_secs } => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    "retry-after",
                    HeaderValue::from_str(&retry_after_secs.to_string()).unwrap(),
                );
                Err(ProviderFailure::Http {
                    status: 429,
                    body: r#"{"error":{"message":"Rate limit reached"}}"#.to_string(),
                    headers,
                })
            }
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            }
        }
    }
}

/// Adapter whose replies are scripted per secret. An empty script answers `Ok`.
pub struct ScriptedAdapter {
    provider_id: String,
    embeddings: bool,
    traffic: Mutex<HashMap<String, VecDeque<Step>>>,
    probes: Mutex<HashMap<String, VecDeque<Step>>>,
    models: Vec<String>,
    calls: AtomicUsize,
    probe_calls: AtomicUsize,
    served: Mutex<Vec<(String, String)>>,
}

impl ScriptedAdapter {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            embeddings: false,
            traffic: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
            calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            served: Mutex::new(Vec::new()),
        }
    }

    pub fn with_embeddings(mut self) -> Self {
        self.embeddings = true;
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Queue traffic replies for a secret
    pub fn script(&self, secret: &str, steps: impl IntoIterator<Item = Step>) {
        self.traffic
            .lock()
            .entry(secret.to_string())
            .or_default()
            .extend(steps);
    }

    /// Queue probe replies for a secret
    pub fn script_probe(&self, secret: &str, steps: impl IntoIterator<Item = Step>) {
        self.probes
            .lock()
            .entry(secret.to_string())
            .or_default()
            .extend(steps);
    }

    /// Adapter calls made by traffic (not probes)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// (secret, model) for each traffic call, in call order
    pub fn served(&self) -> Vec<(String, String)> {
        self.served.lock().clone()
    }

    fn next(queue: &Mutex<HashMap<String, VecDeque<Step>>>, secret: &Secret) -> Step {
        queue
            .lock()
            .get_mut(secret.expose_secret())
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok)
    }

    fn track(&self, secret: &Secret, model: &str) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.served
            .lock()
            .push((secret.expose_secret().to_string(), model.to_string()));
        Self::next(&self.traffic, secret)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn base_url(&self) -> &str {
        "http://scripted.invalid"
    }

    async fn probe_health(&self, secret: &Secret, _base_url: &str) -> Result<RateLimitData, ProviderFailure> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Self::next(&self.probes, secret).run().await?;
        Ok(RateLimitData::default())
    }

    async fn complete(
        &self,
        secret: &Secret,
        request: &ChatRequest,
    ) -> Result<Completion<ChatResponse>, ProviderFailure> {
        let snapshot = self.track(secret, &request.model).run().await?;
        let completion = Completion::new(
            ChatResponse::text(&request.model, "ok").with_usage(Usage::new(10, 5)),
        );
        Ok(match snapshot {
            Some(snapshot) => completion.with_rate_limits(snapshot),
            None => completion,
        })
    }

    async fn list_models(&self, _secret: &Secret) -> Result<Vec<String>, ProviderFailure> {
        Ok(self.models.clone())
    }

    fn supports_embeddings(&self) -> bool {
        self.embeddings
    }

    async fn embed(
        &self,
        secret: &Secret,
        request: &EmbeddingRequest,
    ) -> Result<Completion<EmbeddingResponse>, ProviderFailure> {
        self.track(secret, &request.model).run().await?;
        Ok(Completion::new(EmbeddingResponse {
            model: request.model.clone(),
            data: Vec::new(),
            usage: Some(Usage::new(4, 0)),
        }))
    }
}

/// One `openai` provider serving two chat models, plus an alias and a capability
pub fn config() -> RelayConfig {
    let mut config = RelayConfig::default()
        .with_provider(
            "openai",
            ProviderSettings::new("http://scripted.invalid").with_models(["gpt-4o", "gpt-4o-mini"]),
        )
        .with_alias("fast", "gpt-4o-mini")
        .with_chain("chat", ["gpt-4o", "gpt-4o-mini"])
        .with_chain("vision", ["gpt-5-vision"]);
    config.vault.kdf_iterations = 1_000;
    config
}

pub fn relay(adapter: &Arc<ScriptedAdapter>) -> KeyRelay {
    let relay = KeyRelay::builder()
        .config(config())
        .in_memory()
        .without_default_adapters()
        .adapter(adapter.clone())
        .build()
        .unwrap();
    relay.unlock(Some(PASSPHRASE)).unwrap();
    relay
}

pub fn relay_at(dir: &Path, adapter: &Arc<ScriptedAdapter>) -> KeyRelay {
    KeyRelay::builder()
        .config(config())
        .data_dir(dir)
        .without_default_adapters()
        .adapter(adapter.clone())
        .build()
        .unwrap()
}
