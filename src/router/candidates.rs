//! Candidate Ordering
//!
//! A candidate is one (key, model) pair that could serve a request. Ordering is total and
//! deterministic: key priority, model priority, latency, remaining quota, then enumeration
//! order.

use crate::client::classifier::ClassifiedError;
use crate::health::ModelState;
use crate::vault::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub key_priority: Priority,
    pub model_priority: u8,
    /// Smoothed latency in ms; `None` sorts last
    pub average_latency: Option<f64>,
    /// Requests left in the quota window; `None` is unlimited
    pub remaining: Option<u64>,
    /// Position in enumeration order (chain order, then key insertion order)
    pub order: usize,
}

impl Candidate {
    /// Preference ordering; `Less` means tried first
    pub fn preference(&self, other: &Self) -> Ordering {
        other
            .key_priority
            .rank()
            .cmp(&self.key_priority.rank())
            .then_with(|| other.model_priority.cmp(&self.model_priority))
            .then_with(|| compare_latency(self.average_latency, other.average_latency))
            .then_with(|| compare_remaining(self.remaining, other.remaining))
            .then_with(|| self.order.cmp(&other.order))
    }
}

fn compare_latency(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_remaining(a: Option<u64>, b: Option<u64>) -> Ordering {
    // More remaining first; unknown counts as unlimited
    let a = a.unwrap_or(u64::MAX);
    let b = b.unwrap_or(u64::MAX);
    b.cmp(&a)
}

pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(Candidate::preference);
}

/// One failed attempt, in the order attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub error: ClassifiedError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}/{} (key {}): {}",
            self.attempt, self.provider_id, self.model_id, self.key_id, self.error
        )
    }
}

/// Why a candidate was passed over without a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    CoolingDown { until: Option<DateTime<Utc>> },
    Disabled,
    Probing,
    NoHeadroom,
    CorruptKey,
    KeyRemoved,
    /// No adapter is registered for the key's provider
    NoAdapter,
}

impl SkipReason {
    pub fn from_state(state: ModelState, next_retry_at: Option<DateTime<Utc>>) -> Self {
        match state {
            ModelState::Probing => SkipReason::Probing,
            ModelState::PermanentlyDisabled => SkipReason::Disabled,
            _ => SkipReason::CoolingDown {
                until: next_retry_at,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl SkippedCandidate {
    pub fn new(candidate: &Candidate, reason: SkipReason) -> Self {
        Self {
            key_id: candidate.key_id.clone(),
            provider_id: candidate.provider_id.clone(),
            model_id: candidate.model_id.clone(),
            reason,
        }
    }
}
