//! Session continuity: keep the vault unlocked across a reload of the same
//! tab without asking for the password again.
//!
//! On an opted-in unlock the vault generates a random session key, seals the
//! master key under it with the regular AEAD, and writes
//!
//! ```json
//! { "sessionKeyB64": "...", "nonceB64": "...", "encryptedMasterKeyB64": "..." }
//! ```
//!
//! into a [`SessionStorage`] under [`SESSION_STORAGE_KEY`]. The storage is
//! expected to be volatile and scoped to one tab: it survives a reload but is
//! gone when the tab closes.
//!
//! # Security Notes
//!
//! - The session key sits next to the ciphertext it protects. Anyone who can
//!   read the storage can recover the master key without the password. The
//!   feature is therefore off unless requested per unlock.
//! - The record is removed on every lock, on auto-lock, and on a password
//!   change.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, NONCE_LEN, SecretKey};
use crate::error::{Result, VaultError};

/// Key under which the session record is written.
pub const SESSION_STORAGE_KEY: &str = "hooksafe.session";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Volatile string key/value storage scoped to one tab or process.
///
/// Implementations must be `Send + Sync` so the vault can be shared across
/// async tasks.
pub trait SessionStorage: Send + Sync {
    /// Read the value under `key`.
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store (or overwrite) the value under `key`.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-process [`SessionStorage`].
///
/// Share it through an `Arc` between the vault that wrote the record and the
/// vault that should pick it up after a "reload".
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.items.lock().map_err(|e| VaultError::Session {
            reason: format!("session storage mutex poisoned: {e}"),
        })
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items()?.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The serialized session continuity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_key_b64: String,
    pub nonce_b64: String,
    pub encrypted_master_key_b64: String,
}

impl SessionRecord {
    /// Seal `master_key` under a freshly generated session key.
    pub fn seal(master_key: &SecretKey) -> Result<Self> {
        let session_key = SecretKey::generate()?;
        let (nonce, ciphertext) = crypto::encrypt(master_key.as_bytes(), &session_key)?;

        Ok(Self {
            session_key_b64: BASE64.encode(session_key.as_bytes()),
            nonce_b64: BASE64.encode(nonce),
            encrypted_master_key_b64: BASE64.encode(ciphertext),
        })
    }

    /// Recover the master key.
    ///
    /// # Errors
    ///
    /// [`VaultError::Session`] if a field is not valid base64 or has the wrong
    /// length; [`VaultError::AuthenticationFailed`] if the ciphertext does not
    /// verify.
    pub fn open(&self) -> Result<SecretKey> {
        let mut session_key_bytes = decode_field("sessionKeyB64", &self.session_key_b64)?;
        let session_key = SecretKey::from_slice(&session_key_bytes).map_err(|_| {
            VaultError::Session {
                reason: "session key has the wrong length".into(),
            }
        });
        crypto::secure_zero(&mut session_key_bytes);
        let session_key = session_key?;

        let nonce: [u8; NONCE_LEN] = decode_field("nonceB64", &self.nonce_b64)?
            .try_into()
            .map_err(|_| VaultError::Session {
                reason: "session nonce has the wrong length".into(),
            })?;
        let ciphertext = decode_field("encryptedMasterKeyB64", &self.encrypted_master_key_b64)?;

        let plaintext = crypto::decrypt(&nonce, &ciphertext, &session_key)?;
        SecretKey::from_slice(&plaintext).map_err(|_| VaultError::Session {
            reason: "sealed master key has the wrong length".into(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VaultError::Session {
            reason: format!("unreadable session record: {e}"),
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    BASE64.decode(value).map_err(|e| VaultError::Session {
        reason: format!("{name} is not valid base64: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let master = SecretKey::generate().unwrap();
        let record = SessionRecord::seal(&master).unwrap();

        let json = record.to_json().unwrap();
        assert!(json.contains("\"sessionKeyB64\""));
        assert!(json.contains("\"nonceB64\""));
        assert!(json.contains("\"encryptedMasterKeyB64\""));

        let reopened = SessionRecord::from_json(&json).unwrap().open().unwrap();
        assert_eq!(reopened, master);
    }

    #[test]
    fn each_seal_uses_a_new_session_key() {
        let master = SecretKey::generate().unwrap();
        let a = SessionRecord::seal(&master).unwrap();
        let b = SessionRecord::seal(&master).unwrap();
        assert_ne!(a.session_key_b64, b.session_key_b64);
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let master = SecretKey::generate().unwrap();
        let mut record = SessionRecord::seal(&master).unwrap();

        let mut ciphertext = BASE64.decode(&record.encrypted_master_key_b64).unwrap();
        ciphertext[0] ^= 0x01;
        record.encrypted_master_key_b64 = BASE64.encode(ciphertext);

        let err = record.open().unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn garbage_record_is_session_error() {
        assert!(matches!(
            SessionRecord::from_json("not json"),
            Err(VaultError::Session { .. })
        ));

        let record = SessionRecord {
            session_key_b64: "!!!".into(),
            nonce_b64: String::new(),
            encrypted_master_key_b64: String::new(),
        };
        assert!(matches!(record.open(), Err(VaultError::Session { .. })));
    }

    #[test]
    fn memory_storage_roundtrip() {
        let storage = MemorySessionStorage::new();
        assert!(storage.get_item("k").unwrap().is_none());

        storage.set_item("k", "v1").unwrap();
        storage.set_item("k", "v2").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("v2"));

        storage.remove_item("k").unwrap();
        storage.remove_item("k").unwrap();
        assert!(storage.get_item("k").unwrap().is_none());
    }
}
