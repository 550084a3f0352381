//! Password-derived key management.
//!
//! One symmetric key per backup pair, derived from the user's password with
//! Argon2id and a per-pair random salt. The salt is always persisted (the
//! same password must re-derive the same key on every run); a verifier hash
//! of the derived key is persisted only when the pair is configured to
//! record the password, and is what lets a later run detect that the user
//! typed a different password. Neither the plaintext password nor the raw
//! key ever reaches disk or the log stream.

use std::fs;
use std::path::Path;

use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::EngineError;
use crate::fs_ops;

const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// A derived symmetric key. Wiped from memory on drop.
pub struct Key(Zeroizing<[u8; KEY_LEN]>);

impl Key {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Persisted key record for a pair: the KDF salt plus an optional verifier.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyFile {
    /// Hex-encoded random salt for Argon2id
    pub salt: String,

    /// Hex-encoded SHA-256 of the derived key; present only when the pair
    /// records the password
    pub verifier: Option<String>,
}

/// Result of checking a password against a stored [`KeyFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch,
    /// The pair has no verifier recorded, so nothing can be compared
    NoRecord,
}

/// Derive the pair key from a password and salt.
///
/// Argon2id, 19 MiB / 2 passes: expensive enough to resist brute force,
/// deterministic for a fixed (password, salt).
pub fn derive_key(password: &str, salt: &[u8]) -> Result<Key, EngineError> {
    let params = argon2::Params::new(19 * 1024, 2, 1, Some(KEY_LEN))
        .map_err(|e| EngineError::Crypto {
            message: format!("argon2 params: {}", e),
        })?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut())
        .map_err(|e| EngineError::Crypto {
            message: format!("key derivation: {}", e),
        })?;
    Ok(Key(key))
}

/// Check a derived key against the verifier in a [`KeyFile`].
pub fn verify(key: &Key, record: &KeyFile) -> Verification {
    match &record.verifier {
        None => Verification::NoRecord,
        Some(stored) => {
            let computed = key_verifier(key);
            if constant_time_eq(computed.as_bytes(), stored.as_bytes()) {
                Verification::Match
            } else {
                Verification::Mismatch
            }
        }
    }
}

impl KeyFile {
    /// Load a key record, `None` if the pair has never been backed up.
    pub fn load(path: &Path) -> Result<Option<KeyFile>, EngineError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| EngineError::StateStoreCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| EngineError::StateStoreCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs_ops::atomic_write(path, &bytes)
    }
}

/// Resolve the key for a run, enforcing the password-change contract.
///
/// First run for a pair: generates a salt, writes the key record (with a
/// verifier when `record_password`), returns the fresh key. Later runs:
/// re-derives from the stored salt and compares against the verifier; a
/// mismatch is returned as `EngineError::KeyMismatch` so the engine aborts
/// before touching any file. Callers that want to switch passwords go
/// through [`rekey`] instead, which is the explicit "invalidate prior
/// backups" path.
pub fn authorize(key_path: &Path, password: &str, record_password: bool) -> Result<Key, EngineError> {
    match KeyFile::load(key_path)? {
        Some(mut record) => {
            let salt = decode_hex(&record.salt).ok_or_else(|| EngineError::StateStoreCorrupt {
                path: key_path.to_path_buf(),
                reason: "invalid salt encoding".to_string(),
            })?;
            let key = derive_key(password, &salt)?;
            match verify(&key, &record) {
                Verification::Match => Ok(key),
                Verification::Mismatch => Err(EngineError::KeyMismatch),
                Verification::NoRecord => {
                    if record_password {
                        record.verifier = Some(key_verifier(&key));
                        record.save(key_path)?;
                    }
                    Ok(key)
                }
            }
        }
        None => {
            let mut salt = [0u8; SALT_LEN];
            rand::rngs::OsRng.fill_bytes(&mut salt);
            let key = derive_key(password, &salt)?;
            let record = KeyFile {
                salt: encode_hex(&salt),
                verifier: record_password.then(|| key_verifier(&key)),
            };
            record.save(key_path)?;
            Ok(key)
        }
    }
}

/// Like [`authorize`] for restore: the key record must already exist, and a
/// verifier mismatch aborts before any file is processed.
pub fn authorize_existing(key_path: &Path, password: &str) -> Result<Key, EngineError> {
    let record = KeyFile::load(key_path)?.ok_or_else(|| EngineError::KeyRecordMissing {
        path: key_path.to_path_buf(),
    })?;
    let salt = decode_hex(&record.salt).ok_or_else(|| EngineError::StateStoreCorrupt {
        path: key_path.to_path_buf(),
        reason: "invalid salt encoding".to_string(),
    })?;
    let key = derive_key(password, &salt)?;
    match verify(&key, &record) {
        Verification::Mismatch => Err(EngineError::KeyMismatch),
        _ => Ok(key),
    }
}

/// Replace the pair's key record with one derived from a new password.
///
/// Prior ciphertexts become unreadable under the new key, so the caller is
/// expected to have deleted the state store (forcing a full re-backup)
/// before the next run; `delete_state` does that here when requested.
pub fn rekey(
    key_path: &Path,
    state_path: &Path,
    password: &str,
    record_password: bool,
    delete_state: bool,
) -> Result<Key, EngineError> {
    if delete_state {
        match fs::remove_file(state_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::io(state_path, e)),
        }
    }
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt)?;
    let record = KeyFile {
        salt: encode_hex(&salt),
        verifier: record_password.then(|| key_verifier(&key)),
    };
    record.save(key_path)?;
    Ok(key)
}

fn key_verifier(key: &Key) -> String {
    let digest = Sha256::digest(key.as_bytes());
    encode_hex(&digest)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
