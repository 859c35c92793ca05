//! Key Records
//!
//! Metadata stored per key. The secret itself only appears here sealed.

use crate::client::rate_limits::RateLimitData;
use crate::vault::crypto::Sealed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key priority, compared first when ordering candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Higher rank sorts first
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Key-level health, aggregated from the key's model states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Untested,
    Testing,
    Valid,
    Invalid,
    RetryScheduled,
}

/// A stored API key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// UUID v4
    pub id: String,
    pub provider_id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,

    #[serde(default)]
    pub usage_count: u64,

    #[serde(default)]
    pub is_revoked: bool,

    #[serde(default = "default_true")]
    pub is_enabled: bool,

    #[serde(default)]
    pub priority: Priority,

    /// Smoothed latency in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_latency: Option<f64>,

    #[serde(default)]
    pub verification_status: VerificationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,

    /// Last snapshot reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitData>,

    /// Most recent retry-after hint, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub(crate) sealed: Sealed,

    /// Hex SHA-256 of the plaintext, used for duplicate detection
    pub fingerprint: String,

    /// Set when the sealed secret failed authentication
    #[serde(default)]
    pub is_corrupt: bool,
}

fn default_true() -> bool {
    true
}

impl KeyRecord {
    pub(crate) fn new(
        id: String,
        provider_id: &str,
        label: &str,
        priority: Priority,
        sealed: Sealed,
        fingerprint: String,
    ) -> Self {
        Self {
            id,
            provider_id: provider_id.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
            last_used: None,
            usage_count: 0,
            is_revoked: false,
            is_enabled: true,
            priority,
            average_latency: None,
            verification_status: VerificationStatus::Untested,
            tier: None,
            rate_limits: None,
            retry_after: None,
            next_retry_at: None,
            sealed,
            fingerprint,
            is_corrupt: false,
        }
    }

    /// Eligible to serve traffic at all
    pub fn is_usable(&self) -> bool {
        self.is_enabled && !self.is_revoked && !self.is_corrupt
    }
}

/// Selects records in [`Vault::list_keys`](crate::vault::Vault::list_keys)
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub provider_id: Option<String>,
    pub include_revoked: bool,
    pub usable_only: bool,
}

impl KeyFilter {
    /// Every non-revoked key
    pub fn all() -> Self {
        Self::default()
    }

    pub fn provider(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: Some(provider_id.into()),
            ..Self::default()
        }
    }

    pub fn with_revoked(mut self) -> Self {
        self.include_revoked = true;
        self
    }

    pub fn usable(mut self) -> Self {
        self.usable_only = true;
        self
    }

    pub fn matches(&self, record: &KeyRecord) -> bool {
        if record.is_revoked && !self.include_revoked {
            return false;
        }
        if self.usable_only && !record.is_usable() {
            return false;
        }
        self.provider_id
            .as_deref()
            .map_or(true, |p| p == record.provider_id)
    }
}

/// User-editable metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl KeyPatch {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, record: &mut KeyRecord) {
        if let Some(label) = self.label {
            record.label = label;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(enabled) = self.is_enabled {
            record.is_enabled = enabled;
        }
        if let Some(tier) = self.tier {
            record.tier = Some(tier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str) -> KeyRecord {
        KeyRecord::new(
            "id-1".to_string(),
            provider,
            "primary",
            Priority::High,
            Sealed {
                ciphertext: "Y3Q=".to_string(),
                nonce: "bm9uY2U=".to_string(),
            },
            "ff".to_string(),
        )
    }

    #[test]
    fn test_record_json_layout() {
        let json = serde_json::to_value(record("openai")).unwrap();
        assert_eq!(json["priority"], "high");
        assert_eq!(json["verification_status"], "untested");
        assert_eq!(json["ciphertext"], "Y3Q=");
        assert!(json.get("last_used").is_none());

        let back: KeyRecord = serde_json::from_value(json).unwrap();
        assert!(back.is_enabled);
        assert_eq!(back.sealed.nonce, "bm9uY2U=");
    }

    #[test]
    fn test_filter() {
        let mut revoked = record("openai");
        revoked.is_revoked = true;
        let mut disabled = record("anthropic");
        disabled.is_enabled = false;

        assert!(!KeyFilter::all().matches(&revoked));
        assert!(KeyFilter::all().with_revoked().matches(&revoked));
        assert!(KeyFilter::all().matches(&disabled));
        assert!(!KeyFilter::all().usable().matches(&disabled));
        assert!(!KeyFilter::provider("openai").matches(&disabled));
    }

    #[test]
    fn test_priority_rank() {
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }
}
