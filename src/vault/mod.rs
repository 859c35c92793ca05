//! Key Vault
//!
//! Encrypted storage for provider keys. Records persist as metadata plus a sealed secret;
//! plaintext exists only inside a [`Secret`] handed out by [`Vault::decrypt_secret`].
//!
//! The vault starts locked. [`Vault::unlock`] derives or loads the master key, and the first
//! unlock fixes the mode (passphrase or platform key file) for the lifetime of the data dir.

pub mod crypto;
pub mod record;
pub mod secret;

pub use record::{KeyFilter, KeyPatch, KeyRecord, Priority, VerificationStatus};
pub use secret::Secret;

use crate::client::rate_limits::RateLimitData;
use crate::error::{RelayError, Result, UnlockError};
use crate::store::{Store, Table};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crypto::{MasterKey, Sealed, KEY_LEN};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// How the master key is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMode {
    Passphrase,
    Platform,
}

impl fmt::Display for UnlockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockMode::Passphrase => f.write_str("passphrase"),
            UnlockMode::Platform => f.write_str("platform"),
        }
    }
}

/// Persisted in `vault.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultHeader {
    mode: UnlockMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
    verify: Sealed,
    created_at: DateTime<Utc>,
}

/// Encrypted key store
pub struct Vault {
    store: Arc<Store>,
    kdf_iterations: u32,
    records: RwLock<Vec<KeyRecord>>,
    header: RwLock<Option<VaultHeader>>,
    master_key: RwLock<Option<MasterKey>>,
}

impl Vault {
    /// Load records from the store. The vault is locked until [`Vault::unlock`].
    pub fn open(store: Arc<Store>, kdf_iterations: u32) -> Result<Self> {
        let records: Vec<KeyRecord> = store.load(Table::Keys)?.unwrap_or_default();
        let header: Option<VaultHeader> = store
            .load(Table::Header)
            .map_err(|e| UnlockError::InvalidHeader(e.to_string()))?;

        tracing::debug!(keys = records.len(), "vault loaded");

        Ok(Self {
            store,
            kdf_iterations,
            records: RwLock::new(records),
            header: RwLock::new(header),
            master_key: RwLock::new(None),
        })
    }

    pub fn is_unlocked(&self) -> bool {
        self.master_key.read().is_some()
    }

    /// Mode fixed by the first unlock, if any
    pub fn mode(&self) -> Option<UnlockMode> {
        self.header.read().as_ref().map(|h| h.mode)
    }

    /// Unlock with a passphrase, or with the platform key file when `None`
    pub fn unlock(&self, passphrase: Option<&str>) -> Result<()> {
        if self.is_unlocked() {
            return Ok(());
        }

        let requested = match passphrase {
            Some(_) => UnlockMode::Passphrase,
            None => UnlockMode::Platform,
        };

        let mut header = self.header.write();
        let key = match header.as_ref() {
            Some(existing) => {
                if existing.mode != requested {
                    return Err(UnlockError::ModeMismatch {
                        expected: existing.mode.to_string(),
                    }
                    .into());
                }
                self.key_for_existing(existing, passphrase)?
            }
            None => {
                let (key, created) = self.create_header(passphrase)?;
                self.store.save(Table::Header, &created)?;
                *header = Some(created);
                key
            }
        };

        *self.master_key.write() = Some(key);
        tracing::info!(mode = %requested, "vault unlocked");
        Ok(())
    }

    fn key_for_existing(&self, header: &VaultHeader, passphrase: Option<&str>) -> Result<MasterKey> {
        let key = match passphrase {
            Some(passphrase) => {
                let salt = header
                    .salt
                    .as_deref()
                    .ok_or_else(|| UnlockError::InvalidHeader("missing salt".to_string()))?;
                let salt = BASE64
                    .decode(salt)
                    .map_err(|e| UnlockError::InvalidHeader(format!("salt: {}", e)))?;
                let iterations = header.iterations.unwrap_or(self.kdf_iterations);
                let key = crypto::derive_key(passphrase, &salt, iterations);

                if !crypto::check_verification_token(&key, &header.verify) {
                    tracing::warn!("vault unlock rejected: wrong passphrase");
                    return Err(UnlockError::WrongPassphrase.into());
                }
                key
            }
            None => {
                let key = self
                    .load_platform_key()?
                    .ok_or_else(|| UnlockError::KeyFile("master key file is missing".to_string()))?;

                if !crypto::check_verification_token(&key, &header.verify) {
                    return Err(UnlockError::KeyFile(
                        "master key does not match this vault".to_string(),
                    )
                    .into());
                }
                key
            }
        };

        Ok(key)
    }

    fn create_header(&self, passphrase: Option<&str>) -> Result<(MasterKey, VaultHeader)> {
        let (key, mode, salt, iterations) = match passphrase {
            Some(passphrase) => {
                let salt = crypto::random_salt();
                let key = crypto::derive_key(passphrase, &salt, self.kdf_iterations);
                (
                    key,
                    UnlockMode::Passphrase,
                    Some(BASE64.encode(salt)),
                    Some(self.kdf_iterations),
                )
            }
            None => {
                let key = match self.load_platform_key()? {
                    Some(existing) => existing,
                    None => {
                        let key = crypto::random_key();
                        self.store.save_master_key(key.as_slice())?;
                        key
                    }
                };
                (key, UnlockMode::Platform, None, None)
            }
        };

        let verify = crypto::verification_token(&key)
            .map_err(|_| RelayError::Internal("failed to seal verification token".to_string()))?;

        Ok((
            key,
            VaultHeader {
                mode,
                salt,
                iterations,
                verify,
                created_at: Utc::now(),
            },
        ))
    }

    fn load_platform_key(&self) -> Result<Option<MasterKey>> {
        let Some(bytes) = self.store.load_master_key()? else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(bytes);
        if bytes.len() != KEY_LEN {
            return Err(UnlockError::KeyFile(format!(
                "expected {} bytes, found {}",
                KEY_LEN,
                bytes.len()
            ))
            .into());
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    /// Drop the master key; stored secrets stay sealed until the next unlock
    pub fn lock(&self) {
        if self.master_key.write().take().is_some() {
            tracing::info!("vault locked");
        }
    }

    fn with_key<T>(&self, f: impl FnOnce(&MasterKey) -> Result<T>) -> Result<T> {
        let guard = self.master_key.read();
        let key = guard.as_ref().ok_or(RelayError::LockedVault)?;
        f(key)
    }

    /// Store a new key. Fails with `DuplicateKey` when a non-revoked record holds the same secret.
    pub fn add_key(
        &self,
        provider_id: &str,
        secret: Secret,
        label: &str,
        priority: Priority,
    ) -> Result<KeyRecord> {
        if secret.is_empty() {
            return Err(RelayError::Config("API key must not be empty".to_string()));
        }

        let fingerprint = crypto::fingerprint(secret.expose_secret());
        let id = uuid::Uuid::new_v4().to_string();

        let mut records = self.records.write();
        if let Some(existing) = find_duplicate(&records, &fingerprint, None) {
            return Err(RelayError::DuplicateKey {
                existing_id: existing.id.clone(),
            });
        }

        let sealed = self.with_key(|key| seal_secret(key, &secret, &id))?;
        drop(secret);

        let record = KeyRecord::new(id, provider_id, label, priority, sealed, fingerprint);
        records.push(record.clone());
        self.store.save(Table::Keys, &*records)?;

        tracing::info!(key_id = %record.id, provider = provider_id, label, "key added");
        Ok(record)
    }

    /// Decrypt a key for a single use
    pub fn decrypt_secret(&self, key_id: &str) -> Result<Secret> {
        let record = self
            .get(key_id)
            .ok_or_else(|| RelayError::NotFound(key_id.to_string()))?;
        if record.is_corrupt {
            return Err(RelayError::CorruptKey {
                key_id: key_id.to_string(),
            });
        }

        let opened = self.with_key(|key| Ok(crypto::open(key, &record.sealed, key_id.as_bytes())))?;
        let plaintext = opened
            .ok()
            .and_then(|bytes| std::str::from_utf8(&bytes).ok().map(Secret::new));

        match plaintext {
            Some(secret) => Ok(secret),
            None => {
                tracing::error!(key_id, provider = %record.provider_id, "key failed authentication, marking corrupt");
                self.mark_corrupt(key_id)?;
                Err(RelayError::CorruptKey {
                    key_id: key_id.to_string(),
                })
            }
        }
    }

    /// Logical delete; the record is retained but never decrypted again
    pub fn revoke(&self, key_id: &str) -> Result<KeyRecord> {
        let record = self.modify(key_id, |record| record.is_revoked = true)?;
        tracing::info!(key_id, "key revoked");
        Ok(record)
    }

    /// Physical delete
    pub fn remove_key(&self, key_id: &str) -> Result<KeyRecord> {
        let mut records = self.records.write();
        let idx = records
            .iter()
            .position(|r| r.id == key_id)
            .ok_or_else(|| RelayError::NotFound(key_id.to_string()))?;

        let removed = records.remove(idx);
        self.store.save(Table::Keys, &*records)?;
        tracing::info!(key_id, "key removed");
        Ok(removed)
    }

    /// Replace the secret behind an existing record
    pub fn rotate(&self, key_id: &str, new_secret: Secret) -> Result<KeyRecord> {
        if new_secret.is_empty() {
            return Err(RelayError::Config("API key must not be empty".to_string()));
        }

        let fingerprint = crypto::fingerprint(new_secret.expose_secret());

        let mut records = self.records.write();
        if let Some(existing) = find_duplicate(&records, &fingerprint, Some(key_id)) {
            return Err(RelayError::DuplicateKey {
                existing_id: existing.id.clone(),
            });
        }
        let record = records
            .iter_mut()
            .find(|r| r.id == key_id && !r.is_revoked)
            .ok_or_else(|| RelayError::NotFound(key_id.to_string()))?;

        record.sealed = self.with_key(|key| seal_secret(key, &new_secret, key_id))?;
        record.fingerprint = fingerprint;
        record.is_corrupt = false;
        record.verification_status = VerificationStatus::Untested;
        record.rate_limits = None;
        record.retry_after = None;
        record.next_retry_at = None;

        let rotated = record.clone();
        self.store.save(Table::Keys, &*records)?;
        tracing::info!(key_id, "key rotated");
        Ok(rotated)
    }

    pub fn update_metadata(&self, key_id: &str, patch: KeyPatch) -> Result<KeyRecord> {
        self.modify(key_id, |record| patch.apply(record))
    }

    /// Non-revoked record by id
    pub fn get(&self, key_id: &str) -> Option<KeyRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.id == key_id && !r.is_revoked)
            .cloned()
    }

    /// Records matching `filter`, in insertion order
    pub fn list_keys(&self, filter: &KeyFilter) -> Vec<KeyRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Count one successful use. `last_used` is kept strictly increasing.
    pub fn record_usage(
        &self,
        key_id: &str,
        latency_ms: u64,
        smoothing: f64,
        at: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        self.modify(key_id, |record| {
            record.usage_count += 1;
            record.last_used = Some(match record.last_used {
                Some(prev) if at <= prev => prev + ChronoDuration::milliseconds(1),
                _ => at,
            });

            let sample = latency_ms as f64;
            record.average_latency = Some(match record.average_latency {
                Some(avg) => smoothing * sample + (1.0 - smoothing) * avg,
                None => sample,
            });
        })
    }

    pub(crate) fn mark_corrupt(&self, key_id: &str) -> Result<KeyRecord> {
        self.modify(key_id, |record| record.is_corrupt = true)
    }

    pub(crate) fn apply_rate_limits(&self, key_id: &str, snapshot: &RateLimitData) -> Result<KeyRecord> {
        self.modify(key_id, |record| {
            if snapshot.tier.is_some() {
                record.tier = snapshot.tier.clone();
            }
            record.rate_limits = Some(snapshot.clone());
        })
    }

    /// Sync key-level health fields from its model states
    pub(crate) fn set_health(
        &self,
        key_id: &str,
        status: VerificationStatus,
        retry_after: Option<u64>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<KeyRecord> {
        self.modify(key_id, |record| {
            record.verification_status = status;
            if retry_after.is_some() {
                record.retry_after = retry_after;
            }
            record.next_retry_at = next_retry_at;
        })
    }

    fn modify(&self, key_id: &str, f: impl FnOnce(&mut KeyRecord)) -> Result<KeyRecord> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.id == key_id && !r.is_revoked)
            .ok_or_else(|| RelayError::NotFound(key_id.to_string()))?;

        f(record);
        let updated = record.clone();
        self.store.save(Table::Keys, &*records)?;
        Ok(updated)
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("keys", &self.records.read().len())
            .field("mode", &self.mode())
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

fn find_duplicate<'a>(
    records: &'a [KeyRecord],
    fingerprint: &str,
    except: Option<&str>,
) -> Option<&'a KeyRecord> {
    records.iter().find(|r| {
        !r.is_revoked && r.fingerprint == fingerprint && except.map_or(true, |id| r.id != id)
    })
}

fn seal_secret(key: &MasterKey, secret: &Secret, key_id: &str) -> Result<Sealed> {
    crypto::seal(key, secret.expose_secret().as_bytes(), key_id.as_bytes())
        .map_err(|_| RelayError::Internal("failed to seal key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked_vault() -> Vault {
        let vault = Vault::open(Arc::new(Store::in_memory()), 1_000).unwrap();
        vault.unlock(None).unwrap();
        vault
    }

    #[test]
    fn test_round_trip() {
        let vault = unlocked_vault();
        let record = vault
            .add_key("openai", Secret::new("sk-one"), "primary", Priority::High)
            .unwrap();

        assert_eq!(vault.decrypt_secret(&record.id).unwrap().expose_secret(), "sk-one");
        assert_ne!(record.sealed.ciphertext, "sk-one");
    }

    #[test]
    fn test_locked_vault_refuses_crypto() {
        let vault = Vault::open(Arc::new(Store::in_memory()), 1_000).unwrap();
        assert!(matches!(
            vault.add_key("openai", Secret::new("sk"), "a", Priority::Low),
            Err(RelayError::LockedVault)
        ));

        vault.unlock(None).unwrap();
        let record = vault
            .add_key("openai", Secret::new("sk"), "a", Priority::Low)
            .unwrap();
        vault.lock();
        assert!(matches!(
            vault.decrypt_secret(&record.id),
            Err(RelayError::LockedVault)
        ));
        assert_eq!(vault.list_keys(&KeyFilter::all()).len(), 1);
    }

    #[test]
    fn test_duplicate_rejected_across_labels() {
        let vault = unlocked_vault();
        let first = vault
            .add_key("openai", Secret::new("sk-same"), "one", Priority::High)
            .unwrap();

        match vault.add_key("openai", Secret::new("sk-same"), "two", Priority::Low) {
            Err(RelayError::DuplicateKey { existing_id }) => assert_eq!(existing_id, first.id),
            other => panic!("expected DuplicateKey, got {:?}", other),
        }

        vault.revoke(&first.id).unwrap();
        assert!(vault
            .add_key("openai", Secret::new("sk-same"), "three", Priority::Low)
            .is_ok());
    }

    #[test]
    fn test_tampered_ciphertext_marks_corrupt() {
        let vault = unlocked_vault();
        let record = vault
            .add_key("openai", Secret::new("sk-one"), "primary", Priority::High)
            .unwrap();

        {
            let mut records = vault.records.write();
            let mut bytes = BASE64.decode(&records[0].sealed.ciphertext).unwrap();
            bytes[0] ^= 0xff;
            records[0].sealed.ciphertext = BASE64.encode(bytes);
        }

        assert!(matches!(
            vault.decrypt_secret(&record.id),
            Err(RelayError::CorruptKey { .. })
        ));
        let stored = vault.get(&record.id).unwrap();
        assert!(stored.is_corrupt);
        assert!(!stored.is_usable());
    }

    #[test]
    fn test_rotate_resets_state() {
        let vault = unlocked_vault();
        let record = vault
            .add_key("openai", Secret::new("sk-old"), "primary", Priority::High)
            .unwrap();
        vault.mark_corrupt(&record.id).unwrap();

        let rotated = vault.rotate(&record.id, Secret::new("sk-new")).unwrap();
        assert!(!rotated.is_corrupt);
        assert_ne!(rotated.fingerprint, record.fingerprint);
        assert_eq!(vault.decrypt_secret(&record.id).unwrap().expose_secret(), "sk-new");
    }

    #[test]
    fn test_record_usage_is_monotone() {
        let vault = unlocked_vault();
        let record = vault
            .add_key("openai", Secret::new("sk"), "a", Priority::Medium)
            .unwrap();
        let now = Utc::now();

        let first = vault.record_usage(&record.id, 100, 0.5, now).unwrap();
        let second = vault.record_usage(&record.id, 300, 0.5, now).unwrap();

        assert_eq!(second.usage_count, 2);
        assert!(second.last_used.unwrap() > first.last_used.unwrap());
        assert_eq!(second.average_latency, Some(200.0));
    }

    #[test]
    fn test_passphrase_mode() {
        let store = Arc::new(Store::in_memory());
        let vault = Vault::open(store.clone(), 1_000).unwrap();
        vault.unlock(Some("correct horse")).unwrap();
        vault.unlock(Some("anything")).unwrap();
        vault.lock();

        assert!(matches!(
            vault.unlock(Some("wrong")),
            Err(RelayError::Unlock(UnlockError::WrongPassphrase))
        ));
        assert!(matches!(
            vault.unlock(None),
            Err(RelayError::Unlock(UnlockError::ModeMismatch { .. }))
        ));
        vault.unlock(Some("correct horse")).unwrap();
        assert_eq!(vault.mode(), Some(UnlockMode::Passphrase));
    }

    #[test]
    fn test_revoked_key_is_not_found() {
        let vault = unlocked_vault();
        let record = vault
            .add_key("openai", Secret::new("sk"), "a", Priority::Medium)
            .unwrap();
        vault.revoke(&record.id).unwrap();

        assert!(matches!(
            vault.decrypt_secret(&record.id),
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(vault.revoke(&record.id), Err(RelayError::NotFound(_))));
    }
}
