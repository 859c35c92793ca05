//! Model Registry
//!
//! Holds every (key, model) pair's [`ModelAvailability`] and persists it to `models.json`.

use crate::client::rate_limits::RateLimitData;
use crate::error::Result;
use crate::health::backoff::BackoffPolicy;
use crate::health::machine::{ModelAvailability, ModelState, Transition, TransitionEvent};
use crate::store::{Store, Table};
use crate::vault::VerificationStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type PairKey = (String, String);

#[derive(Debug)]
pub struct ModelRegistry {
    store: Arc<Store>,
    pairs: RwLock<BTreeMap<PairKey, ModelAvailability>>,
}

impl ModelRegistry {
    pub fn open(store: Arc<Store>) -> Result<Self> {
        let stored: Vec<ModelAvailability> = store.load(Table::Models)?.unwrap_or_default();
        let pairs = stored
            .into_iter()
            .map(|mut m| {
                // Persisted before a probe finished; nothing is probing in a fresh process
                if m.state == ModelState::Probing || m.state == ModelState::Unavailable {
                    m.state = ModelState::Untested;
                    m.is_available = false;
                }
                ((m.key_id.clone(), m.model_id.clone()), m)
            })
            .collect();

        Ok(Self {
            store,
            pairs: RwLock::new(pairs),
        })
    }

    pub fn get(&self, key_id: &str, model_id: &str) -> Option<ModelAvailability> {
        self.pairs
            .read()
            .get(&(key_id.to_string(), model_id.to_string()))
            .cloned()
    }

    pub fn contains(&self, key_id: &str, model_id: &str) -> bool {
        self.pairs
            .read()
            .contains_key(&(key_id.to_string(), model_id.to_string()))
    }

    pub fn for_key(&self, key_id: &str) -> Vec<ModelAvailability> {
        self.pairs
            .read()
            .values()
            .filter(|m| m.key_id == key_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ModelAvailability> {
        self.pairs.read().values().cloned().collect()
    }

    /// Insert `seed` unless the pair already exists. Returns true when inserted.
    pub fn ensure(&self, seed: ModelAvailability) -> Result<bool> {
        let mut pairs = self.pairs.write();
        let key = (seed.key_id.clone(), seed.model_id.clone());
        if pairs.contains_key(&key) {
            return Ok(false);
        }
        pairs.insert(key, seed);
        self.persist(&pairs)?;
        Ok(true)
    }

    /// Apply an event to an existing pair; `None` when the pair is unknown
    pub fn transition(
        &self,
        key_id: &str,
        model_id: &str,
        event: &TransitionEvent,
        now: DateTime<Utc>,
        policy: &BackoffPolicy,
    ) -> Result<Option<Transition>> {
        let mut pairs = self.pairs.write();
        let Some(pair) = pairs.get_mut(&(key_id.to_string(), model_id.to_string())) else {
            return Ok(None);
        };

        let transition = pair.apply(event, now, policy);
        if transition.applied {
            self.persist(&pairs)?;
        }
        Ok(Some(transition))
    }

    /// Apply an event to every pair of a key
    pub fn transition_key(
        &self,
        key_id: &str,
        event: &TransitionEvent,
        now: DateTime<Utc>,
        policy: &BackoffPolicy,
    ) -> Result<usize> {
        let mut pairs = self.pairs.write();
        let mut applied = 0;
        for pair in pairs.values_mut().filter(|m| m.key_id == key_id) {
            if pair.apply(event, now, policy).applied {
                applied += 1;
            }
        }
        if applied > 0 {
            self.persist(&pairs)?;
        }
        Ok(applied)
    }

    /// Copy a provider snapshot onto every pair of a key
    pub fn apply_rate_limits(&self, key_id: &str, snapshot: &RateLimitData) -> Result<()> {
        let mut pairs = self.pairs.write();
        let mut touched = false;
        for pair in pairs.values_mut().filter(|m| m.key_id == key_id) {
            pair.apply_rate_limits(snapshot);
            touched = true;
        }
        if touched {
            self.persist(&pairs)?;
        }
        Ok(())
    }

    pub fn remove_key(&self, key_id: &str) -> Result<usize> {
        let mut pairs = self.pairs.write();
        let before = pairs.len();
        pairs.retain(|(key, _), _| key != key_id);
        let removed = before - pairs.len();
        if removed > 0 {
            self.persist(&pairs)?;
        }
        Ok(removed)
    }

    /// Key-level status derived from its pairs, plus the earliest scheduled retry
    pub fn key_status(&self, key_id: &str) -> (VerificationStatus, Option<DateTime<Utc>>) {
        let pairs = self.pairs.read();
        let states: Vec<&ModelAvailability> = pairs.values().filter(|m| m.key_id == key_id).collect();
        let next_retry = states.iter().filter_map(|m| m.next_retry_at).min();

        let has = |state: ModelState| states.iter().any(|m| m.state == state);
        let status = if has(ModelState::Available) {
            VerificationStatus::Valid
        } else if has(ModelState::Probing) {
            VerificationStatus::Testing
        } else if has(ModelState::CoolingDown) {
            VerificationStatus::RetryScheduled
        } else if !states.is_empty() && states.iter().all(|m| m.state.is_terminal()) {
            VerificationStatus::Invalid
        } else {
            VerificationStatus::Untested
        };

        (status, next_retry)
    }

    fn persist(&self, pairs: &BTreeMap<PairKey, ModelAvailability>) -> Result<()> {
        let rows: Vec<&ModelAvailability> = pairs.values().collect();
        self.store.save(Table::Models, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::classifier::{ClassifiedError, ErrorKind};

    fn registry() -> ModelRegistry {
        ModelRegistry::open(Arc::new(Store::in_memory())).unwrap()
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let registry = registry();
        assert!(registry.ensure(ModelAvailability::new("k1", "openai", "m1", 3)).unwrap());
        assert!(!registry.ensure(ModelAvailability::new("k1", "openai", "m1", 5)).unwrap());
        assert_eq!(registry.get("k1", "m1").unwrap().model_priority, 3);
    }

    #[test]
    fn test_transition_unknown_pair() {
        let registry = registry();
        let result = registry
            .transition("k1", "m1", &TransitionEvent::TrafficSucceeded, Utc::now(), &BackoffPolicy::default())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_key_status_aggregation() {
        let registry = registry();
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        registry.ensure(ModelAvailability::new("k1", "openai", "m1", 3)).unwrap();
        registry.ensure(ModelAvailability::new("k1", "openai", "m2", 3)).unwrap();
        assert_eq!(registry.key_status("k1").0, VerificationStatus::Untested);

        let auth = TransitionEvent::TrafficFailed(ClassifiedError::new(ErrorKind::Auth, "bad key"));
        registry.transition_key("k1", &auth, now, &policy).unwrap();
        assert_eq!(registry.key_status("k1"), (VerificationStatus::Invalid, None));

        registry.transition_key("k1", &TransitionEvent::ManualReset, now, &policy).unwrap();
        let server = TransitionEvent::TrafficFailed(ClassifiedError::new(ErrorKind::Server, "502"));
        registry.transition("k1", "m1", &server, now, &policy).unwrap();
        let (status, next) = registry.key_status("k1");
        assert_eq!(status, VerificationStatus::RetryScheduled);
        assert!(next.is_some());
    }

    #[test]
    fn test_reload_resets_in_flight_probes() {
        let store = Arc::new(Store::in_memory());
        {
            let registry = ModelRegistry::open(store.clone()).unwrap();
            registry.ensure(ModelAvailability::new("k1", "openai", "m1", 3)).unwrap();
            registry
                .transition("k1", "m1", &TransitionEvent::ProbeStarted, Utc::now(), &BackoffPolicy::default())
                .unwrap();
        }

        let registry = ModelRegistry::open(store).unwrap();
        assert_eq!(registry.get("k1", "m1").unwrap().state, ModelState::Untested);
    }

    #[test]
    fn test_remove_key_cascades() {
        let registry = registry();
        registry.ensure(ModelAvailability::new("k1", "openai", "m1", 3)).unwrap();
        registry.ensure(ModelAvailability::new("k2", "openai", "m1", 3)).unwrap();

        assert_eq!(registry.remove_key("k1").unwrap(), 1);
        assert!(registry.for_key("k1").is_empty());
        assert!(registry.contains("k2", "m1"));
    }
}
