//! Availability State Machine
//!
//! One instance per (key, model). The machine decides whether a pair may receive traffic
//! right now; callers never compare retry timestamps themselves.
//!
//! ```text
//! Untested | Available | CoolingDown(due) --ProbeStarted--> Probing
//! Probing --ProbeSucceeded--> Available
//! non-terminal --*Failed--> Unavailable --> CoolingDown | PermanentlyDisabled
//! non-terminal --TrafficSucceeded--> Available
//! any --ManualReset--> Untested
//! ```

use crate::client::classifier::ClassifiedError;
use crate::client::rate_limits::RateLimitData;
use crate::config::ModelInfo;
use crate::health::backoff::{BackoffPolicy, RetryDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Untested,
    Probing,
    Available,
    /// Transient: a failed pair settles into `CoolingDown` or `PermanentlyDisabled` within
    /// the same transition, so this is never stored.
    Unavailable,
    CoolingDown,
    PermanentlyDisabled,
}

impl ModelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelState::PermanentlyDisabled)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelState::Untested => "untested",
            ModelState::Probing => "probing",
            ModelState::Available => "available",
            ModelState::Unavailable => "unavailable",
            ModelState::CoolingDown => "cooling_down",
            ModelState::PermanentlyDisabled => "permanently_disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionEvent {
    ProbeStarted,
    ProbeSucceeded,
    ProbeFailed(ClassifiedError),
    TrafficSucceeded,
    TrafficFailed(ClassifiedError),
    ManualReset,
}

impl TransitionEvent {
    fn name(&self) -> &'static str {
        match self {
            TransitionEvent::ProbeStarted => "probe_started",
            TransitionEvent::ProbeSucceeded => "probe_succeeded",
            TransitionEvent::ProbeFailed(_) => "probe_failed",
            TransitionEvent::TrafficSucceeded => "traffic_succeeded",
            TransitionEvent::TrafficFailed(_) => "traffic_failed",
            TransitionEvent::ManualReset => "manual_reset",
        }
    }
}

/// Result of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ModelState,
    pub to: ModelState,
    /// False when the event is not valid in the current state and was ignored
    pub applied: bool,
}

/// Verification and health metadata for one (key, model) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAvailability {
    pub key_id: String,
    pub provider_id: String,
    pub model_id: String,

    /// Cache of `state == Available`
    pub is_available: bool,
    pub state: ModelState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,

    /// 1-5, higher is preferred
    pub model_priority: u8,

    #[serde(default)]
    pub retry_count: u32,

    /// Set only while cooling down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_remaining: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_reset_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output: Option<u32>,
}

impl ModelAvailability {
    pub fn new(
        key_id: impl Into<String>,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        model_priority: u8,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            is_available: false,
            state: ModelState::Untested,
            last_checked_at: None,
            model_priority: model_priority.clamp(1, 5),
            retry_count: 0,
            next_retry_at: None,
            last_error_code: None,
            error_message: None,
            quota_remaining: None,
            quota_reset_at: None,
            capabilities: Vec::new(),
            rate_limits: None,
            context_window: None,
            max_output: None,
        }
    }

    pub fn with_info(mut self, info: &ModelInfo) -> Self {
        self.capabilities = info.capabilities.clone();
        self.context_window = info.context_window;
        self.max_output = info.max_output;
        self
    }

    /// May receive traffic at `now`
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ModelState::Untested | ModelState::Available => true,
            ModelState::CoolingDown => self.next_retry_at.map_or(false, |at| at <= now),
            ModelState::Probing | ModelState::Unavailable | ModelState::PermanentlyDisabled => false,
        }
    }

    /// Whether `ProbeStarted` would be accepted at `now`
    pub fn can_probe(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            // A Probing pair whose probe slot is free was abandoned mid-probe
            ModelState::Untested | ModelState::Available | ModelState::Probing => true,
            ModelState::CoolingDown => self.next_retry_at.map_or(true, |at| at <= now),
            ModelState::Unavailable | ModelState::PermanentlyDisabled => false,
        }
    }

    pub fn apply(
        &mut self,
        event: &TransitionEvent,
        now: DateTime<Utc>,
        policy: &BackoffPolicy,
    ) -> Transition {
        let from = self.state;

        let applied = match event {
            TransitionEvent::ManualReset => {
                self.reset();
                true
            }
            _ if from.is_terminal() => false,
            TransitionEvent::ProbeStarted => {
                if self.can_probe(now) {
                    self.state = ModelState::Probing;
                    self.next_retry_at = None;
                    self.last_checked_at = Some(now);
                    true
                } else {
                    false
                }
            }
            TransitionEvent::ProbeSucceeded => {
                if from == ModelState::Probing {
                    self.succeed(now);
                    true
                } else {
                    false
                }
            }
            TransitionEvent::ProbeFailed(error) => {
                if from == ModelState::Probing {
                    self.fail(error, now, policy);
                    true
                } else {
                    false
                }
            }
            TransitionEvent::TrafficSucceeded => {
                self.succeed(now);
                true
            }
            TransitionEvent::TrafficFailed(error) => {
                self.fail(error, now, policy);
                true
            }
        };

        self.is_available = self.state == ModelState::Available;

        let transition = Transition {
            from,
            to: self.state,
            applied,
        };
        if applied && from != self.state {
            tracing::debug!(
                key_id = %self.key_id,
                model = %self.model_id,
                event = event.name(),
                from = %from,
                to = %self.state,
                retry_count = self.retry_count,
                "model state transition"
            );
        }
        transition
    }

    fn succeed(&mut self, now: DateTime<Utc>) {
        self.state = ModelState::Available;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.last_checked_at = Some(now);
        self.last_error_code = None;
        self.error_message = None;
    }

    fn fail(&mut self, error: &ClassifiedError, now: DateTime<Utc>, policy: &BackoffPolicy) {
        let previous = self.retry_count;
        self.state = ModelState::Unavailable;
        self.retry_count = previous.saturating_add(1);
        self.last_checked_at = Some(now);
        self.last_error_code = Some(
            error
                .code
                .clone()
                .unwrap_or_else(|| error.kind.as_str().to_string()),
        );
        self.error_message = Some(error.message.clone());

        match policy.schedule(error, previous, self.quota_reset_at, now) {
            RetryDecision::RetryAt(at) => {
                self.state = ModelState::CoolingDown;
                self.next_retry_at = Some(at);
            }
            RetryDecision::Disable => {
                self.state = ModelState::PermanentlyDisabled;
                self.next_retry_at = None;
            }
        }
    }

    fn reset(&mut self) {
        self.state = ModelState::Untested;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.last_error_code = None;
        self.error_message = None;
    }

    /// Fold a provider snapshot into the pair's quota fields
    pub fn apply_rate_limits(&mut self, snapshot: &RateLimitData) {
        if snapshot.requests_remaining.is_some() {
            self.quota_remaining = snapshot.requests_remaining;
        }
        if snapshot.reset_at.is_some() {
            self.quota_reset_at = snapshot.reset_at;
        }
        self.rate_limits = Some(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::classifier::ErrorKind;
    use std::time::Duration;

    fn pair() -> ModelAvailability {
        ModelAvailability::new("k1", "openai", "gpt-4o", 3)
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default().without_jitter()
    }

    fn failed(kind: ErrorKind) -> TransitionEvent {
        TransitionEvent::TrafficFailed(ClassifiedError::new(kind, "boom"))
    }

    #[test]
    fn test_probe_cycle() {
        let now = Utc::now();
        let mut m = pair();
        assert!(m.apply(&TransitionEvent::ProbeStarted, now, &policy()).applied);
        assert_eq!(m.state, ModelState::Probing);
        assert!(!m.is_selectable(now));

        m.apply(&TransitionEvent::ProbeSucceeded, now, &policy());
        assert_eq!(m.state, ModelState::Available);
        assert!(m.is_available);
    }

    #[test]
    fn test_probe_result_outside_probing_is_ignored() {
        let now = Utc::now();
        let mut m = pair();
        let t = m.apply(&TransitionEvent::ProbeSucceeded, now, &policy());
        assert!(!t.applied);
        assert_eq!(m.state, ModelState::Untested);
    }

    #[test]
    fn test_auth_disables_without_retry() {
        let now = Utc::now();
        let mut m = pair();
        m.apply(&failed(ErrorKind::Auth), now, &policy());

        assert_eq!(m.state, ModelState::PermanentlyDisabled);
        assert!(m.next_retry_at.is_none());
        assert!(!m.is_selectable(now + chrono::Duration::days(365)));

        let t = m.apply(&TransitionEvent::TrafficSucceeded, now, &policy());
        assert!(!t.applied);
        assert_eq!(m.state, ModelState::PermanentlyDisabled);

        m.apply(&TransitionEvent::ManualReset, now, &policy());
        assert_eq!(m.state, ModelState::Untested);
        assert_eq!(m.retry_count, 0);
    }

    #[test]
    fn test_rate_limit_retry_after_is_exact() {
        let now = Utc::now();
        let mut m = pair();
        let error = ClassifiedError::new(ErrorKind::RateLimit, "slow down")
            .with_retry_after(Duration::from_millis(2500));
        m.apply(&TransitionEvent::TrafficFailed(error), now, &policy());

        let due = now + chrono::Duration::milliseconds(2500);
        assert_eq!(m.state, ModelState::CoolingDown);
        assert_eq!(m.next_retry_at, Some(due));
        assert!(!m.is_selectable(due - chrono::Duration::milliseconds(1)));
        assert!(m.is_selectable(due));
    }

    #[test]
    fn test_retry_count_grows_and_resets() {
        let now = Utc::now();
        let mut m = pair();
        for expected in 1..=3 {
            m.apply(&failed(ErrorKind::Server), now, &policy());
            assert_eq!(m.retry_count, expected);
        }
        assert_eq!(
            m.next_retry_at,
            Some(now + chrono::Duration::seconds(4))
        );

        m.apply(&TransitionEvent::TrafficSucceeded, now, &policy());
        assert_eq!(m.retry_count, 0);
        assert!(m.next_retry_at.is_none());
    }

    #[test]
    fn test_transient_failures_eventually_disable() {
        let now = Utc::now();
        let mut m = pair();
        for _ in 0..5 {
            m.apply(&failed(ErrorKind::Network), now, &policy());
            assert_eq!(m.state, ModelState::CoolingDown);
        }
        m.apply(&failed(ErrorKind::Unknown), now, &policy());
        assert_eq!(m.state, ModelState::PermanentlyDisabled);
        assert!(m.next_retry_at.is_none());
    }

    #[test]
    fn test_cooling_down_probe_waits_until_due() {
        let now = Utc::now();
        let mut m = pair();
        m.apply(&failed(ErrorKind::Server), now, &policy());

        assert!(!m.apply(&TransitionEvent::ProbeStarted, now, &policy()).applied);
        let later = now + chrono::Duration::seconds(2);
        assert!(m.apply(&TransitionEvent::ProbeStarted, later, &policy()).applied);
        assert!(m.next_retry_at.is_none());
    }

    #[test]
    fn test_quota_uses_known_reset() {
        let now = Utc::now();
        let mut m = pair();
        let reset = now + chrono::Duration::minutes(30);
        m.apply_rate_limits(&RateLimitData {
            requests_remaining: Some(0),
            reset_at: Some(reset),
            ..RateLimitData::default()
        });

        m.apply(&failed(ErrorKind::Quota), now, &policy());
        assert_eq!(m.next_retry_at, Some(reset));
        assert_eq!(m.quota_remaining, Some(0));
    }

    #[test]
    fn test_metadata_serializes_snake_case_state() {
        let json = serde_json::to_value(pair()).unwrap();
        assert_eq!(json["state"], "untested");
        let back: ModelAvailability = serde_json::from_value(json).unwrap();
        assert_eq!(back, pair());
    }
}
