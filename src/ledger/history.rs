//! Usage and Error Log
//!
//! Append-only facts, one per attempt outcome. Entries are never edited; removing a key
//! leaves its history in place.

use crate::client::classifier::{ClassifiedError, ErrorKind};
use crate::error::Result;
use crate::store::{Store, Table};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One successful call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageDataPoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub estimated_cost: f64,
    /// 1-based attempt number within its request
    pub attempt: u32,
}

/// Where a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Traffic,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    pub fn for_kind(kind: ErrorKind) -> Self {
        if kind.is_transient() {
            Severity::Warning
        } else {
            Severity::Error
        }
    }
}

/// One failed call or probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub severity: Severity,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl ErrorLogEntry {
    pub fn new(
        key_id: &str,
        provider_id: &str,
        model_id: &str,
        error: &ClassifiedError,
        source: LogSource,
        attempt: Option<u32>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            key_id: key_id.to_string(),
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            kind: error.kind,
            message: error.message.clone(),
            status: error.status,
            code: error.code.clone(),
            retry_after_ms: error.retry_after_ms,
            severity: Severity::for_kind(error.kind),
            source,
            attempt,
        }
    }
}

/// Filter for history reads; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub key_id: Option<String>,
    pub model_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` entries
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn key(key_id: impl Into<String>) -> Self {
        Self {
            key_id: Some(key_id.into()),
            ..Self::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, key_id: &str, model_id: &str, at: DateTime<Utc>) -> bool {
        self.key_id.as_deref().map_or(true, |k| k == key_id)
            && self.model_id.as_deref().map_or(true, |m| m == model_id)
            && self.since.map_or(true, |s| at >= s)
    }
}

/// Per-key totals for dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub key_id: String,
    pub requests: u64,
    pub errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct History {
    store: Arc<Store>,
    usage: RwLock<Vec<UsageDataPoint>>,
    errors: RwLock<Vec<ErrorLogEntry>>,
}

impl History {
    pub fn open(store: Arc<Store>) -> Result<Self> {
        let usage = store.read_log(Table::Usage)?;
        let errors = store.read_log(Table::Errors)?;
        Ok(Self {
            store,
            usage: RwLock::new(usage),
            errors: RwLock::new(errors),
        })
    }

    pub fn append_usage(&self, point: UsageDataPoint) -> Result<()> {
        let mut usage = self.usage.write();
        self.store.append(Table::Usage, &point)?;
        usage.push(point);
        Ok(())
    }

    pub fn append_error(&self, entry: ErrorLogEntry) -> Result<()> {
        let mut errors = self.errors.write();
        self.store.append(Table::Errors, &entry)?;
        errors.push(entry);
        Ok(())
    }

    pub fn usage(&self, query: &HistoryQuery) -> Vec<UsageDataPoint> {
        let usage = self.usage.read();
        let matched: Vec<UsageDataPoint> = usage
            .iter()
            .filter(|p| query.matches(&p.key_id, &p.model_id, p.timestamp))
            .cloned()
            .collect();
        newest(matched, query.limit)
    }

    pub fn errors(&self, query: &HistoryQuery) -> Vec<ErrorLogEntry> {
        let errors = self.errors.read();
        let matched: Vec<ErrorLogEntry> = errors
            .iter()
            .filter(|e| query.matches(&e.key_id, &e.model_id, e.timestamp))
            .cloned()
            .collect();
        newest(matched, query.limit)
    }

    /// Totals per key, ordered by key id
    pub fn usage_summary(&self, key_id: Option<&str>) -> Vec<UsageSummary> {
        let mut summaries: BTreeMap<String, (UsageSummary, u64)> = BTreeMap::new();

        for point in self.usage.read().iter() {
            if key_id.map_or(false, |k| k != point.key_id) {
                continue;
            }
            let (summary, latency_total) = summaries
                .entry(point.key_id.clone())
                .or_insert_with(|| (summary_for(&point.key_id), 0));
            summary.requests += 1;
            summary.prompt_tokens += point.prompt_tokens;
            summary.completion_tokens += point.completion_tokens;
            summary.total_tokens += point.total_tokens;
            summary.estimated_cost += point.estimated_cost;
            summary.last_used = summary.last_used.max(Some(point.timestamp));
            *latency_total += point.latency_ms;
        }

        for entry in self.errors.read().iter() {
            if key_id.map_or(false, |k| k != entry.key_id) || entry.source != LogSource::Traffic {
                continue;
            }
            summaries
                .entry(entry.key_id.clone())
                .or_insert_with(|| (summary_for(&entry.key_id), 0))
                .0
                .errors += 1;
        }

        summaries
            .into_values()
            .map(|(mut summary, latency_total)| {
                if summary.requests > 0 {
                    summary.average_latency_ms = Some(latency_total as f64 / summary.requests as f64);
                }
                summary
            })
            .collect()
    }
}

fn summary_for(key_id: &str) -> UsageSummary {
    UsageSummary {
        key_id: key_id.to_string(),
        ..UsageSummary::default()
    }
}

fn newest<T>(mut entries: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
    }
    entries
}
