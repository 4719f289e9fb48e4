//! Vault error types.
//!
//! Every public API in this crate returns [`VaultError`]. The store layer has
//! its own [`StoreError`] which the vault propagates unchanged inside
//! [`VaultError::Storage`], so callers can always tell a storage outage apart
//! from a cryptographic failure.

use thiserror::Error;

/// Unified error type for the hooksafe secrets vault.
#[derive(Debug, Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// The authentication tag did not verify: wrong key, or the stored
    /// ciphertext/nonce was tampered with.
    #[error("authentication failed: {context}")]
    AuthenticationFailed { context: String },

    /// Encryption failed (bad key length, CSPRNG failure).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Key derivation failed (invalid Argon2 parameters or salt length).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- State errors -------------------------------------------------------
    /// A mutating operation was attempted while no master key is held.
    #[error("vault is locked")]
    Locked,

    /// There is no salt in the store, so there is nothing to export.
    #[error("vault has not been set up yet")]
    NotInitialized,

    // -- Data errors --------------------------------------------------------
    /// A stored value has the wrong shape (e.g. a nonce of the wrong length,
    /// or decrypted bytes that are not a secret bundle).
    #[error("invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// An import file was rejected. Nothing was written.
    #[error("invalid import file: {reason}")]
    ImportFormat { reason: String },

    /// The session continuity record could not be written or read.
    #[error("session storage error: {reason}")]
    Session { reason: String },

    /// The configuration file could not be read or parsed.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors. Prefer a typed variant.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Returns `true` for a MAC mismatch.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {err}"))
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors raised by a [`SecretStore`](crate::store::SecretStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row exists but cannot be turned back into a stored value.
    #[error("corrupt store entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// A blocking task was cancelled or panicked, or a mutex was poisoned.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
