//! Sealing primitives
//!
//! AES-256-GCM with a fresh 96-bit nonce per seal and the record id as associated data, so a
//! ciphertext moved onto another record fails authentication.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

const FINGERPRINT_DOMAIN: &[u8] = b"keyrelay.fingerprint.v1\0";
const VERIFY_PLAINTEXT: &[u8] = b"keyrelay vault verification";
const VERIFY_AAD: &[u8] = b"keyrelay.verify";

pub type MasterKey = Zeroizing<[u8; KEY_LEN]>;

/// Why a sealed value could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    Encoding,
    NonceLength,
    Authentication,
}

/// Base64 ciphertext and nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

pub fn random_key() -> MasterKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// PBKDF2-HMAC-SHA256
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> MasterKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    key
}

fn cipher(key: &MasterKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()))
}

pub fn seal(key: &MasterKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, aes_gcm::Error> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher(key).encrypt(&nonce, Payload { msg: plaintext, aad })?;

    Ok(Sealed {
        ciphertext: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce),
    })
}

pub fn open(key: &MasterKey, sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, OpenError> {
    let nonce = BASE64.decode(&sealed.nonce).map_err(|_| OpenError::Encoding)?;
    if nonce.len() != NONCE_LEN {
        return Err(OpenError::NonceLength);
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|_| OpenError::Encoding)?;

    cipher(key)
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| OpenError::Authentication)
}

/// Token sealed at vault creation; opening it proves the passphrase
pub fn verification_token(key: &MasterKey) -> Result<Sealed, aes_gcm::Error> {
    seal(key, VERIFY_PLAINTEXT, VERIFY_AAD)
}

pub fn check_verification_token(key: &MasterKey, token: &Sealed) -> bool {
    matches!(open(key, token, VERIFY_AAD), Ok(plain) if plain.as_slice() == VERIFY_PLAINTEXT)
}

/// Domain-separated SHA-256 of a secret, hex encoded
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = random_key();
        let sealed = seal(&key, b"sk-abc", b"key-1").unwrap();
        assert_eq!(open(&key, &sealed, b"key-1").unwrap().as_slice(), b"sk-abc");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let key = random_key();
        let a = seal(&key, b"same", b"id").unwrap();
        let b = seal(&key, b"same", b"id").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_associated_data_fails() {
        let key = random_key();
        let sealed = seal(&key, b"sk-abc", b"key-1").unwrap();
        assert_eq!(open(&key, &sealed, b"key-2"), Err(OpenError::Authentication));
    }

    #[test]
    fn test_tampered_inputs() {
        let key = random_key();
        let sealed = seal(&key, b"sk-abc", b"id").unwrap();

        let mut bytes = BASE64.decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        let flipped = Sealed {
            ciphertext: BASE64.encode(bytes),
            nonce: sealed.nonce.clone(),
        };
        assert_eq!(open(&key, &flipped, b"id"), Err(OpenError::Authentication));

        let short_nonce = Sealed {
            ciphertext: sealed.ciphertext.clone(),
            nonce: BASE64.encode([0u8; 8]),
        };
        assert_eq!(open(&key, &short_nonce, b"id"), Err(OpenError::NonceLength));

        let garbage = Sealed {
            ciphertext: "***".to_string(),
            nonce: sealed.nonce,
        };
        assert_eq!(open(&key, &garbage, b"id"), Err(OpenError::Encoding));
    }

    #[test]
    fn test_derive_key_and_verification() {
        let salt = random_salt();
        let key = derive_key("hunter2", &salt, 1_000);
        let token = verification_token(&key).unwrap();

        assert!(check_verification_token(&derive_key("hunter2", &salt, 1_000), &token));
        assert!(!check_verification_token(&derive_key("hunter3", &salt, 1_000), &token));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = fingerprint("sk-abc");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint("sk-abc"));
        assert_ne!(fp, fingerprint("sk-abd"));
    }
}
