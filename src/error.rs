//! keyrelay Error Types
//!
//! Vault errors surface to the caller directly. Classified provider failures never do on
//! their own: they are folded into [`RelayError::Exhausted`] once every candidate failed.

use crate::client::classifier::ClassifiedError;
use crate::router::{AttemptFailure, SkippedCandidate};
use thiserror::Error;

/// Main error type for keyrelay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (invalid JSON, empty chains, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A non-revoked key with the same secret already exists
    #[error("A key with the same secret is already stored as '{existing_id}'")]
    DuplicateKey { existing_id: String },

    /// Decrypt/encrypt attempted before unlock
    #[error("Vault is locked. Call unlock() before using stored keys")]
    LockedVault,

    /// Ciphertext failed authentication; the record is flagged and kept
    #[error("Key '{key_id}' could not be decrypted and was marked unusable. Re-add the key to restore it")]
    CorruptKey { key_id: String },

    /// Unknown or revoked key id
    #[error("Key '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Unlock(#[from] UnlockError),

    /// Nothing is configured to serve the target
    #[error("No keys are configured for '{target}'. Add a key for a provider that serves it")]
    NoCandidates { target: String },

    /// Every candidate was tried or filtered out
    #[error(
        "All candidates for '{target}' are unavailable ({} failed, {} skipped)",
        .failures.len(),
        .skipped.len()
    )]
    Exhausted {
        target: String,
        failures: Vec<AttemptFailure>,
        skipped: Vec<SkippedCandidate>,
    },

    /// `list_models` failed for a key
    #[error("Model discovery failed for key '{key_id}': {error}")]
    Discovery { key_id: String, error: ClassifiedError },

    /// The caller abandoned the request
    #[error("Request cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// Persistent store failures
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why an unlock attempt was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnlockError {
    #[error("Wrong passphrase for this vault")]
    WrongPassphrase,

    #[error("Vault was created in {expected} mode")]
    ModeMismatch { expected: String },

    #[error("Master key file is unreadable: {0}")]
    KeyFile(String),

    #[error("Vault header is invalid: {0}")]
    InvalidHeader(String),
}

impl RelayError {
    /// Errors raised by vault operations
    pub fn is_vault_error(&self) -> bool {
        matches!(
            self,
            RelayError::DuplicateKey { .. }
                | RelayError::LockedVault
                | RelayError::CorruptKey { .. }
                | RelayError::NotFound(_)
                | RelayError::Unlock(_)
        )
    }

    /// Classified failures carried by an exhausted request, in attempt order
    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            RelayError::Exhausted { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Result type alias for keyrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_counts() {
        let err = RelayError::Exhausted {
            target: "fast".to_string(),
            failures: Vec::new(),
            skipped: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "All candidates for 'fast' are unavailable (0 failed, 0 skipped)"
        );
        assert!(!err.is_vault_error());
    }

    #[test]
    fn test_unlock_error_is_vault_error() {
        let err: RelayError = UnlockError::WrongPassphrase.into();
        assert!(err.is_vault_error());
        assert_eq!(err.to_string(), "Wrong passphrase for this vault");
    }
}
