//! Persistence for the vault's encrypted-at-rest material.
//!
//! A [`SecretStore`] is a small binary key/value store. The vault uses
//! exactly two kinds of keys:
//!
//! - [`SALT_KEY`] (`"salt"`) holds the raw Argon2id salt.
//! - `"app:<entity id>"` (see [`entity_key`]) holds one [`SealedRecord`] per
//!   app: the XSalsa20-Poly1305 nonce and ciphertext of its secret bundle.
//!
//! Nothing else is written, and nothing written here is plaintext secret
//! material. Two backends ship with the crate:
//!
//! - [`MemoryStore`] — a `BTreeMap` behind an async `RwLock`, for tests and
//!   ephemeral use.
//! - [`SqliteStore`] — a single SQLite table with BLOB columns, driven on the
//!   blocking thread pool.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreResult;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Well-known key of the salt record.
pub const SALT_KEY: &str = "salt";

/// Prefix of every per-app record key.
pub const ENTITY_PREFIX: &str = "app:";

/// Build the store key for an entity id.
pub fn entity_key(entity_id: &str) -> String {
    format!("{ENTITY_PREFIX}{entity_id}")
}

/// Recover the entity id from a store key, if it is an entity key.
pub fn entity_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(ENTITY_PREFIX)
}

// ---------------------------------------------------------------------------
// Stored values
// ---------------------------------------------------------------------------

/// An authenticated ciphertext together with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// A value held by a [`SecretStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// Raw bytes (the salt).
    Bytes(Vec<u8>),
    /// A sealed per-app record.
    Sealed(SealedRecord),
}

impl StoredValue {
    /// Borrow the raw bytes, if this is a [`StoredValue::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Sealed(_) => None,
        }
    }

    /// Take the sealed record, if this is a [`StoredValue::Sealed`].
    pub fn into_sealed(self) -> Option<SealedRecord> {
        match self {
            Self::Sealed(record) => Some(record),
            Self::Bytes(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Binary key/value persistence used by the vault.
///
/// Implementations must be `Send + Sync` so a vault handle can move between
/// tasks. Errors are reported as [`StoreError`](crate::error::StoreError)
/// and reach the caller unchanged.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>>;

    /// Insert or overwrite the value under `key`.
    async fn put(&self, key: &str, value: StoredValue) -> StoreResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Remove every key.
    async fn clear(&self) -> StoreResult<()>;

    /// Remove every key, then write `entries`.
    ///
    /// Backends that can do so perform this as one atomic step; the vault
    /// relies on it for password changes and imports.
    async fn replace_all(&self, entries: Vec<(String, StoredValue)>) -> StoreResult<()>;
}
