//! Client-side encrypted secrets vault for hooksafe.
//!
//! Stores per-app webhook credentials (client secrets, signing keys) so that
//! only ciphertext ever reaches persistent storage. The master key is derived
//! from a user password with Argon2id and lives in memory only while the
//! vault is unlocked. Each app's record is sealed with XSalsa20-Poly1305
//! under its own key, derived from the master key with keyed BLAKE2b, so one
//! app's ciphertext never decrypts under another app's key.
//!
//! # Modules
//!
//! - [`vault`] — the [`Vault`] handle: unlock, lock, read and write secrets.
//! - [`crypto`] — Argon2id, per-app key derivation, AEAD, random bytes.
//! - [`store`] — the [`SecretStore`] trait plus memory and SQLite backends.
//! - [`session`] — optional reload-surviving unlock.
//! - [`export`] — the portable backup format.
//! - [`bundle`] — the plaintext field map kept per app.
//! - [`config`] — TOML configuration.
//! - [`error`] — unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hooksafe_vault::{SqliteStore, Vault, VaultConfig};
//!
//! # async fn example() -> hooksafe_vault::Result<()> {
//! let store = SqliteStore::open("data/hooksafe.db")?;
//! let vault = Vault::new(Arc::new(store), VaultConfig::default());
//! vault.initialize().await?;
//!
//! if !vault.unlock("correct horse battery staple").await? {
//!     eprintln!("wrong password");
//!     return Ok(());
//! }
//!
//! vault
//!     .set_secret("github-app", [("client_secret", "s3cr3t"), ("signing_key", "k")])
//!     .await?;
//! let secret = vault.get_secret("github-app", "client_secret").await?;
//! assert_eq!(secret.as_deref(), Some("s3cr3t"));
//!
//! vault.lock();
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod export;
pub mod session;
pub mod store;
mod timer;
pub mod vault;

pub use bundle::SecretBundle;
pub use config::VaultConfig;
pub use crypto::KdfParams;
pub use error::{Result, StoreError, VaultError};
pub use export::VaultExport;
pub use session::{MemorySessionStorage, SessionStorage};
pub use store::{MemoryStore, SecretStore, SqliteStore};
pub use vault::{UnlockOptions, Vault, VaultBuilder, VaultSnapshot, VaultStatus};
