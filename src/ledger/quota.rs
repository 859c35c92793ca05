//! Quota Ledger
//!
//! Running request/token/cost accounting per key. Local usage is additive; a provider
//! snapshot replaces whatever was counted locally. Window counters are zeroed lazily on the
//! first read after `reset_time`.

use crate::client::rate_limits::RateLimitData;
use crate::error::Result;
use crate::ledger::history::{History, HistoryQuery, UsageDataPoint};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyQuota {
    /// Requests allowed per window, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    pub used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_limit: Option<u64>,
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    /// Cumulative; not reset with the window
    pub estimated_cost: f64,
}

impl KeyQuota {
    fn roll(&mut self, now: DateTime<Utc>) -> bool {
        match self.reset_time {
            Some(reset) if reset <= now => {
                self.used = 0;
                self.tokens_used = 0;
                self.reset_time = None;
                true
            }
            _ => false,
        }
    }

    fn needs_roll(&self, now: DateTime<Utc>) -> bool {
        self.reset_time.map_or(false, |reset| reset <= now)
    }

    fn clamp(&mut self) {
        if let Some(limit) = self.limit {
            self.used = self.used.min(limit);
        }
    }

    pub fn has_headroom(&self) -> bool {
        self.limit.map_or(true, |limit| self.used < limit)
            && self.tokens_limit.map_or(true, |limit| self.tokens_used < limit)
    }

    /// Requests left in the window; `None` when no limit is known
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.used))
    }
}

#[derive(Debug)]
pub struct QuotaLedger {
    history: Arc<History>,
    quotas: RwLock<HashMap<String, KeyQuota>>,
}

impl QuotaLedger {
    pub fn new(history: Arc<History>) -> Self {
        Self {
            history,
            quotas: RwLock::new(HashMap::new()),
        }
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    /// Log a successful call and count it against the key
    pub fn record(&self, point: UsageDataPoint) -> Result<()> {
        {
            let mut quotas = self.quotas.write();
            let quota = quotas.entry(point.key_id.clone()).or_default();
            quota.roll(point.timestamp);
            quota.used += 1;
            quota.tokens_used += point.total_tokens;
            quota.estimated_cost += point.estimated_cost;
            quota.clamp();
        }
        self.history.append_usage(point)
    }

    /// Overwrite limits and usage with the provider's view
    pub fn apply_rate_limit_snapshot(&self, key_id: &str, snapshot: &RateLimitData) {
        let mut quotas = self.quotas.write();
        let quota = quotas.entry(key_id.to_string()).or_default();
        overwrite(quota, snapshot);
    }

    pub fn has_headroom(&self, key_id: &str, now: DateTime<Utc>) -> bool {
        self.get(key_id, now).has_headroom()
    }

    pub fn remaining(&self, key_id: &str, now: DateTime<Utc>) -> Option<u64> {
        self.get(key_id, now).remaining()
    }

    /// Current quota for a key, rolling the window if it has elapsed
    pub fn get(&self, key_id: &str, now: DateTime<Utc>) -> KeyQuota {
        {
            let quotas = self.quotas.read();
            match quotas.get(key_id) {
                None => return KeyQuota::default(),
                Some(quota) if !quota.needs_roll(now) => return quota.clone(),
                Some(_) => {}
            }
        }

        let mut quotas = self.quotas.write();
        let quota = quotas.entry(key_id.to_string()).or_default();
        if quota.roll(now) {
            tracing::debug!(key_id, "quota window reset");
        }
        quota.clone()
    }

    pub fn remove(&self, key_id: &str) {
        self.quotas.write().remove(key_id);
    }

    /// Rebuild a key's quota from its last provider snapshot and logged usage
    pub fn seed(&self, key_id: &str, snapshot: Option<&RateLimitData>, now: DateTime<Utc>) {
        let mut quota = KeyQuota::default();
        if let Some(snapshot) = snapshot {
            overwrite(&mut quota, snapshot);
        }

        let points = self.history.usage(&HistoryQuery::key(key_id));
        quota.estimated_cost = points.iter().map(|p| p.estimated_cost).sum();

        // Usage logged after the snapshot was read still counts against its window
        if let Some(reset) = quota.reset_time.filter(|reset| *reset > now) {
            let captured_at = snapshot.and_then(|s| s.captured_at);
            for point in points
                .iter()
                .filter(|p| captured_at.map_or(true, |at| p.timestamp > at) && p.timestamp < reset)
            {
                quota.used += 1;
                quota.tokens_used += point.total_tokens;
            }
            quota.clamp();
        } else {
            quota.roll(now);
        }

        self.quotas.write().insert(key_id.to_string(), quota);
    }
}

fn overwrite(quota: &mut KeyQuota, snapshot: &RateLimitData) {
    if let Some(limit) = snapshot.requests_limit {
        quota.limit = Some(limit);
    }
    if let Some(remaining) = snapshot.requests_remaining {
        quota.used = quota.limit.map_or(0, |limit| limit.saturating_sub(remaining));
        if quota.limit.is_none() && remaining == 0 {
            quota.limit = Some(0);
        }
    }
    if let Some(limit) = snapshot.tokens_limit {
        quota.tokens_limit = Some(limit);
    }
    if let Some(remaining) = snapshot.tokens_remaining {
        quota.tokens_used = quota
            .tokens_limit
            .map_or(0, |limit| limit.saturating_sub(remaining));
    }
    if snapshot.reset_at.is_some() {
        quota.reset_time = snapshot.reset_at;
    }
    quota.clamp();
}
