//! Error Classification
//!
//! Normalizes every provider failure into a closed taxonomy. The rules are applied in a
//! fixed priority order and never depend on which adapter produced the failure.

use crate::client::adapter::{floor_char_boundary, ProviderFailure};
use crate::client::rate_limits::{parse_duration_string, parse_retry_after};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classified failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Server,
    Network,
    Quota,
    Unknown,
}

impl ErrorKind {
    /// Kinds that schedule an automatic retry
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorKind::Auth)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Server => "server",
            ErrorKind::Network => "network",
            ErrorKind::Quota => "quota",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure after classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
            status: None,
            code: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

const RATE_LIMIT_CODES: &[&str] = &["rate_limit_exceeded", "rate_limit_error", "rate_limited"];
const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "rate_limit", "too many requests"];

const AUTH_CODES: &[&str] = &[
    "invalid_api_key",
    "authentication_error",
    "permission_error",
    "permission_denied",
    "unauthenticated",
    "invalid_authentication",
    "account_deactivated",
];

const SERVER_CODES: &[&str] = &[
    "server_error",
    "api_error",
    "overloaded_error",
    "internal",
    "unavailable",
    "service_unavailable",
];

const QUOTA_CODES: &[&str] = &[
    "insufficient_quota",
    "billing_hard_limit_reached",
    "resource_exhausted",
    "quota_exceeded",
];
const QUOTA_PHRASES: &[&str] = &["quota", "billing", "credit balance", "insufficient credits"];

/// Everything the rules look at, extracted once from the raw failure
#[derive(Debug, Default)]
struct Signal {
    status: Option<u16>,
    codes: Vec<String>,
    text: String,
    message: String,
    retry_after: Option<Duration>,
    transport: bool,
}

impl Signal {
    fn from_failure(failure: &ProviderFailure) -> Self {
        match failure {
            ProviderFailure::Http {
                status,
                body,
                headers,
            } => {
                let json = serde_json::from_str::<serde_json::Value>(body).ok();
                let mut codes = Vec::new();
                let mut message = None;
                let mut body_retry = None;

                if let Some(json) = &json {
                    collect_codes(json, &mut codes);
                    message = json
                        .pointer("/error/message")
                        .or_else(|| json.get("message"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string);
                    body_retry = find_retry_hint(json, 0);
                }

                Signal {
                    status: Some(*status),
                    codes,
                    text: body.to_lowercase(),
                    message: message.unwrap_or_else(|| {
                        if body.is_empty() {
                            format!("HTTP {}", status)
                        } else {
                            body[..floor_char_boundary(body, 300)].to_string()
                        }
                    }),
                    retry_after: parse_retry_after(headers, None).or(body_retry),
                    transport: false,
                }
            }
            ProviderFailure::Api {
                code,
                message,
                retry_after,
            } => Signal {
                codes: vec![code.to_lowercase()],
                text: message.to_lowercase(),
                message: format!("{}: {}", code, message),
                retry_after: *retry_after,
                ..Default::default()
            },
            ProviderFailure::Transport { message, .. } => Signal {
                text: message.to_lowercase(),
                message: message.clone(),
                transport: true,
                ..Default::default()
            },
            ProviderFailure::Unsupported(_) | ProviderFailure::Other(_) => {
                let message = failure.to_string();
                Signal {
                    text: message.to_lowercase(),
                    message,
                    ..Default::default()
                }
            }
        }
    }

    fn has_code(&self, set: &[&str]) -> bool {
        self.codes.iter().any(|c| set.contains(&c.as_str()))
    }

    fn mentions(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| self.text.contains(p))
    }

    fn primary_code(&self) -> Option<String> {
        self.codes.first().cloned()
    }
}

/// Classify a raw provider failure
pub fn classify(failure: &ProviderFailure, provider_id: &str, model_id: &str) -> ClassifiedError {
    let signal = Signal::from_failure(failure);
    let status = signal.status;

    let kind = if status == Some(429)
        || signal.has_code(RATE_LIMIT_CODES)
        || (!signal.transport && signal.mentions(RATE_LIMIT_PHRASES))
    {
        ErrorKind::RateLimit
    } else if matches!(status, Some(401) | Some(403)) || signal.has_code(AUTH_CODES) {
        ErrorKind::Auth
    } else if matches!(status, Some(500..=599)) || signal.has_code(SERVER_CODES) {
        ErrorKind::Server
    } else if signal.transport || status == Some(408) {
        ErrorKind::Network
    } else if status == Some(402) || signal.has_code(QUOTA_CODES) || signal.mentions(QUOTA_PHRASES) {
        ErrorKind::Quota
    } else {
        ErrorKind::Unknown
    };

    ClassifiedError {
        kind,
        message: format!("[{}/{}] {}", provider_id, model_id, signal.message),
        retry_after_ms: signal.retry_after.map(|d| d.as_millis() as u64),
        status,
        code: signal.primary_code(),
    }
}

/// Gather `error.code`, `error.type`, `error.status` and top-level `type` values, lowercased
fn collect_codes(json: &serde_json::Value, codes: &mut Vec<String>) {
    let candidates = [
        json.pointer("/error/code"),
        json.pointer("/error/type"),
        json.pointer("/error/status"),
        json.get("code"),
    ];

    for value in candidates.into_iter().flatten() {
        if let Some(s) = value.as_str() {
            let code = s.to_lowercase();
            if code != "error" && !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
}

/// Look for `retry_after_ms`, `retry_after` or `retryDelay` anywhere in the body
fn find_retry_hint(json: &serde_json::Value, depth: usize) -> Option<Duration> {
    if depth > 4 {
        return None;
    }

    match json {
        serde_json::Value::Object(map) => {
            if let Some(ms) = map.get("retry_after_ms").and_then(|v| v.as_f64()) {
                return Some(Duration::from_millis(ms.max(0.0) as u64));
            }
            for key in ["retry_after", "retryDelay"] {
                match map.get(key) {
                    Some(serde_json::Value::Number(n)) => {
                        if let Some(secs) = n.as_f64() {
                            return Some(Duration::from_secs_f64(secs.max(0.0)));
                        }
                    }
                    Some(serde_json::Value::String(s)) => {
                        if let Some(d) = parse_duration_string(s) {
                            return Some(d);
                        }
                    }
                    _ => {}
                }
            }
            map.values().find_map(|v| find_retry_hint(v, depth + 1))
        }
        serde_json::Value::Array(items) => items.iter().find_map(|v| find_retry_hint(v, depth + 1)),
        _ => None,
    }
}
