//! The vault: master key lifecycle, per-app decrypt-and-cache, auto-lock.
//!
//! A [`Vault`] is a cheap `Clone` handle around shared state. It moves
//! through three states:
//!
//! ```text
//!  Uninitialized ──unlock (first run: new salt)──▶ Unlocked
//!        ▲                                         │  ▲
//!        │ reset_all                  lock/timeout │  │ unlock(password)
//!        │                                         ▼  │
//!        └────────────────reset_all──────────── Locked
//! ```
//!
//! While unlocked the master key lives in a private field and nowhere else.
//! Per-app DEKs are rederived for every encrypt/decrypt and dropped (zeroed)
//! immediately. Decrypted bundles are cached per app until the next lock.
//!
//! # Concurrency
//!
//! Operations that touch the store are serialised by an async mutex held for
//! the whole operation. Key material and flags sit behind a synchronous
//! mutex that is never held across an `.await`, which keeps [`Vault::lock`]
//! and the state queries synchronous. A generation counter, bumped on every
//! lock and unlock, stops an operation that straddled a lock (for example
//! an auto-lock firing mid-way) from repopulating the cache afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use zeroize::{Zeroize, Zeroizing};

use crate::bundle::SecretBundle;
use crate::config::VaultConfig;
use crate::crypto::{self, NONCE_LEN, SALT_LEN, SecretKey};
use crate::error::{Result, VaultError};
use crate::export::VaultExport;
use crate::session::{SESSION_STORAGE_KEY, SessionRecord, SessionStorage};
use crate::store::{
    ENTITY_PREFIX, SALT_KEY, SealedRecord, SecretStore, StoredValue, entity_id_from_key,
    entity_key,
};
use crate::timer::AutoLockTimer;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Externally observable vault state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    /// No salt persisted yet; the next unlock performs first-time setup.
    Uninitialized,
    /// A salt exists but no master key is held.
    Locked,
    /// The master key is in memory and the auto-lock timer is running.
    Unlocked,
}

/// Point-in-time view of the vault, published through [`Vault::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultSnapshot {
    pub status: VaultStatus,
    pub has_stored_secrets: bool,
}

/// Per-unlock options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlockOptions {
    /// Keep the vault unlocked across a reload via the session storage.
    pub remember_session: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    master_key: Option<SecretKey>,
    cache: HashMap<String, SecretBundle>,
    generation: u64,
    initialized: bool,
    has_salt: bool,
    has_stored_secrets: bool,
}

impl State {
    fn is_unlocked(&self) -> bool {
        self.master_key.is_some()
    }

    /// Zero and drop the master key and every cached bundle.
    fn wipe(&mut self) {
        if let Some(mut key) = self.master_key.take() {
            key.zeroize();
        }
        self.cache.clear();
        self.generation += 1;
    }

    fn install(&mut self, key: SecretKey) {
        self.wipe();
        self.master_key = Some(key);
    }

    fn status(&self) -> VaultStatus {
        if self.is_unlocked() {
            VaultStatus::Unlocked
        } else if self.has_salt {
            VaultStatus::Locked
        } else {
            VaultStatus::Uninitialized
        }
    }
}

struct Shared {
    store: Arc<dyn SecretStore>,
    session: Option<Arc<dyn SessionStorage>>,
    config: VaultConfig,
    op: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    timer: AutoLockTimer,
    events: watch::Sender<VaultSnapshot>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`Vault`].
pub struct VaultBuilder {
    store: Arc<dyn SecretStore>,
    config: VaultConfig,
    session: Option<Arc<dyn SessionStorage>>,
}

impl VaultBuilder {
    pub fn config(mut self, config: VaultConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable session continuity backed by `storage`. Each unlock still has
    /// to opt in through [`UnlockOptions::remember_session`].
    pub fn session_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.session = Some(storage);
        self
    }

    pub fn build(self) -> Vault {
        let (events, _) = watch::channel(VaultSnapshot {
            status: VaultStatus::Uninitialized,
            has_stored_secrets: false,
        });

        Vault {
            shared: Arc::new(Shared {
                store: self.store,
                session: self.session,
                timer: AutoLockTimer::new(self.config.auto_lock_timeout()),
                config: self.config,
                op: tokio::sync::Mutex::new(()),
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Client-side encrypted secrets vault.
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use hooksafe_vault::{MemoryStore, Vault, VaultConfig};
/// # async fn example() -> hooksafe_vault::Result<()> {
/// let vault = Vault::new(Arc::new(MemoryStore::new()), VaultConfig::default());
/// vault.initialize().await?;
///
/// assert!(vault.unlock("Str0ng!Passw0rd12").await?);
/// vault.set_secret("app1", [("client_secret", "abc")]).await?;
/// assert_eq!(
///     vault.get_secret("app1", "client_secret").await?.as_deref(),
///     Some("abc")
/// );
///
/// vault.lock();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Vault {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Start building a vault over `store`.
    pub fn builder(store: Arc<dyn SecretStore>) -> VaultBuilder {
        VaultBuilder {
            store,
            config: VaultConfig::default(),
            session: None,
        }
    }

    /// A vault over `store` without session continuity.
    pub fn new(store: Arc<dyn SecretStore>, config: VaultConfig) -> Self {
        Self::builder(store).config(config).build()
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Load persisted state and, if a session record is present, restore the
    /// unlocked state from it.
    ///
    /// An empty store is the normal first-run condition, not an error. Safe to
    /// call more than once.
    pub async fn initialize(&self) -> Result<()> {
        let _op = self.shared.op.lock().await;
        self.load_persisted_state().await?;

        if !self.is_locked() {
            return Ok(());
        }
        self.restore_session();
        self.publish();
        Ok(())
    }

    /// Unlock with `password` without session continuity.
    pub async fn unlock(&self, password: &str) -> Result<bool> {
        self.unlock_with(password, UnlockOptions::default()).await
    }

    /// Unlock with `password`.
    ///
    /// On first run a new salt is generated and any password is accepted.
    /// Otherwise the derived key is checked by authenticating exactly one
    /// stored app record; `Ok(false)` means the password is wrong. A rejected
    /// password also locks a vault that was already unlocked, so no key
    /// material survives a failed attempt. With a salt but no app records
    /// there is nothing to check against and the password is accepted.
    ///
    /// # Errors
    ///
    /// Storage failures and KDF failures. A wrong password is never an error.
    pub async fn unlock_with(&self, password: &str, options: UnlockOptions) -> Result<bool> {
        let _op = self.shared.op.lock().await;
        if !self.state().initialized {
            self.load_persisted_state().await?;
        }

        let has_stored_secrets = self.state().has_stored_secrets;
        let stored_salt = if has_stored_secrets {
            self.read_salt().await?
        } else {
            None
        };

        let master_key = match stored_salt {
            Some(salt) => {
                let candidate = self.derive_key(password, salt.to_vec()).await?;
                if !self.verify_candidate(&candidate).await? {
                    tracing::warn!("unlock rejected: password did not authenticate stored data");
                    drop(candidate);
                    self.lock_with_reason("failed unlock");
                    return Ok(false);
                }
                candidate
            }
            None => {
                let salt = crypto::generate_salt()?;
                let key = self.derive_key(password, salt.to_vec()).await?;
                self.shared
                    .store
                    .put(SALT_KEY, StoredValue::Bytes(salt.to_vec()))
                    .await?;
                self.state().has_salt = true;
                tracing::info!("first-time setup: generated new vault salt");
                key
            }
        };

        self.install_key(master_key, options.remember_session)?;
        tracing::info!(remember_session = options.remember_session, "vault unlocked");
        Ok(true)
    }

    /// Zero the master key, drop the plaintext cache, stop the auto-lock
    /// timer and remove the session record. Locking a locked vault is a
    /// no-op.
    pub fn lock(&self) {
        self.lock_with_reason("explicit");
    }

    /// Reset the auto-lock countdown. Ignored while locked.
    pub fn notify_activity(&self) {
        if !self.is_locked() {
            self.arm_timer();
        }
    }

    // -- State queries ------------------------------------------------------

    pub fn is_locked(&self) -> bool {
        !self.state().is_unlocked()
    }

    /// Whether the store held a salt or app records at the last check.
    pub fn has_stored_secrets(&self) -> bool {
        self.state().has_stored_secrets
    }

    pub fn status(&self) -> VaultStatus {
        self.state().status()
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        let state = self.state();
        VaultSnapshot {
            status: state.status(),
            has_stored_secrets: state.has_stored_secrets,
        }
    }

    /// Receive a new [`VaultSnapshot`] whenever the vault changes state.
    pub fn subscribe(&self) -> watch::Receiver<VaultSnapshot> {
        self.shared.events.subscribe()
    }

    /// Ids of every app with a stored record. Works while locked.
    pub async fn list_entities(&self) -> Result<Vec<String>> {
        let keys = self.shared.store.keys_with_prefix(ENTITY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| entity_id_from_key(key))
            .map(str::to_string)
            .collect())
    }

    // -- Secrets ------------------------------------------------------------

    /// One field of an app's secret bundle.
    ///
    /// Returns `Ok(None)` while locked, when the app has no record, or when
    /// the field is not set.
    ///
    /// # Errors
    ///
    /// [`VaultError::AuthenticationFailed`] if the stored record does not
    /// verify (corruption or tampering).
    pub async fn get_secret(&self, entity_id: &str, field: &str) -> Result<Option<String>> {
        let bundle = self.get_bundle(entity_id).await?;
        Ok(bundle.and_then(|b| b.get(field).map(str::to_string)))
    }

    /// The whole secret bundle of an app. Same semantics as
    /// [`get_secret`](Self::get_secret).
    pub async fn get_bundle(&self, entity_id: &str) -> Result<Option<SecretBundle>> {
        let _op = self.shared.op.lock().await;

        let (key, generation) = {
            let state = self.state();
            let Some(key) = state.master_key.clone() else {
                return Ok(None);
            };
            (key, state.generation)
        };

        self.load_bundle(&key, generation, entity_id).await
    }

    /// Merge `updates` into an app's bundle and persist it under a fresh
    /// nonce.
    ///
    /// # Errors
    ///
    /// [`VaultError::Locked`] if no master key is held; nothing is written.
    pub async fn set_secret<I, K, V>(&self, entity_id: &str, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let updates: Vec<(String, String)> = updates
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let _op = self.shared.op.lock().await;
        let (key, generation) = self.current_key()?;

        let mut bundle = self
            .load_bundle(&key, generation, entity_id)
            .await?
            .unwrap_or_default();
        let updated_fields = updates.len();
        bundle.merge(updates);

        let record = seal_bundle(&key, entity_id, &bundle)?;
        drop(key);
        self.shared
            .store
            .put(&entity_key(entity_id), StoredValue::Sealed(record))
            .await?;

        {
            let mut state = self.state();
            if state.generation == generation && state.is_unlocked() {
                state.cache.insert(entity_id.to_string(), bundle);
            }
            state.has_stored_secrets = true;
        }
        self.publish();

        tracing::info!(entity_id = %entity_id, updated_fields, "stored app secrets");
        Ok(())
    }

    /// Delete an app's record and evict it from the cache.
    ///
    /// # Errors
    ///
    /// [`VaultError::Locked`] if no master key is held; nothing is deleted.
    pub async fn remove_secret(&self, entity_id: &str) -> Result<()> {
        let _op = self.shared.op.lock().await;
        drop(self.current_key()?);

        self.shared.store.delete(&entity_key(entity_id)).await?;
        let remaining = self
            .shared
            .store
            .keys_with_prefix(ENTITY_PREFIX)
            .await?
            .len();

        {
            let mut state = self.state();
            state.cache.remove(entity_id);
            state.has_stored_secrets = remaining > 0;
        }
        self.publish();

        tracing::info!(entity_id = %entity_id, remaining, "removed app secrets");
        Ok(())
    }

    /// Re-encrypt every app under a master key derived from `new_password`
    /// and a brand-new salt.
    ///
    /// Every record is decrypted and re-sealed in memory before anything is
    /// written; the new salt and records then replace the old contents in a
    /// single [`SecretStore::replace_all`]. The session record is removed.
    ///
    /// # Errors
    ///
    /// [`VaultError::Locked`] if no master key is held.
    /// [`VaultError::AuthenticationFailed`] if any stored record fails to
    /// decrypt; the store is left untouched in that case.
    pub async fn change_master_password(&self, new_password: &str) -> Result<()> {
        let _op = self.shared.op.lock().await;
        let (old_key, generation) = self.current_key()?;

        let keys = self.shared.store.keys_with_prefix(ENTITY_PREFIX).await?;
        let mut bundles = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some(entity_id) = entity_id_from_key(key) else {
                continue;
            };
            let Some(record) = self.read_record(key).await? else {
                continue;
            };
            bundles.push((
                entity_id.to_string(),
                open_bundle(&old_key, entity_id, &record)?,
            ));
        }
        drop(old_key);

        let salt = crypto::generate_salt()?;
        let new_key = self.derive_key(new_password, salt.to_vec()).await?;

        let mut entries = Vec::with_capacity(bundles.len() + 1);
        entries.push((SALT_KEY.to_string(), StoredValue::Bytes(salt.to_vec())));
        for (entity_id, bundle) in &bundles {
            let record = seal_bundle(&new_key, entity_id, bundle)?;
            entries.push((entity_key(entity_id), StoredValue::Sealed(record)));
        }

        self.shared.store.replace_all(entries).await?;
        self.clear_session_record();

        let count = bundles.len();
        let installed = {
            let mut state = self.state();
            if state.generation == generation && state.is_unlocked() {
                state.install(new_key);
                state.cache = bundles.into_iter().collect();
                state.has_salt = true;
                true
            } else {
                false
            }
        };

        if installed {
            self.arm_timer();
        } else {
            tracing::warn!("vault locked during password change; unlock with the new password");
        }
        self.publish();

        tracing::info!(count, "master password changed");
        Ok(())
    }

    /// Delete the salt and every app record and return to
    /// [`VaultStatus::Uninitialized`]. Irreversible.
    pub async fn reset_all(&self) -> Result<()> {
        let _op = self.shared.op.lock().await;
        self.lock_with_reason("reset");

        self.shared.store.clear().await?;
        {
            let mut state = self.state();
            state.has_salt = false;
            state.has_stored_secrets = false;
            state.initialized = true;
        }
        self.publish();

        tracing::warn!("vault reset: salt and all app secrets deleted");
        Ok(())
    }

    // -- Export / import ----------------------------------------------------

    /// Export the salt and every sealed record. Works while locked; no
    /// plaintext is included.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotInitialized`] if there is no salt.
    pub async fn export(&self) -> Result<VaultExport> {
        let _op = self.shared.op.lock().await;
        let salt = self.read_salt().await?.ok_or(VaultError::NotInitialized)?;

        let keys = self.shared.store.keys_with_prefix(ENTITY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some(entity_id) = entity_id_from_key(key) else {
                continue;
            };
            if let Some(record) = self.read_record(key).await? {
                records.push((entity_id.to_string(), record));
            }
        }

        tracing::info!(count = records.len(), "exported vault");
        Ok(VaultExport::from_parts(
            &salt,
            records.iter().map(|(id, record)| (id.as_str(), record)),
        ))
    }

    /// Replace the whole store with the contents of `export`.
    ///
    /// The export is validated first; on any format problem nothing is
    /// written. The vault is locked, since every DEK changes with the salt.
    ///
    /// # Errors
    ///
    /// [`VaultError::ImportFormat`] for an invalid export.
    pub async fn import(&self, export: &VaultExport) -> Result<()> {
        let decoded = export.decode()?;

        let _op = self.shared.op.lock().await;
        self.lock_with_reason("import");

        let count = decoded.apps.len();
        let mut entries = Vec::with_capacity(count + 1);
        entries.push((SALT_KEY.to_string(), StoredValue::Bytes(decoded.salt.to_vec())));
        for (entity_id, record) in decoded.apps {
            entries.push((entity_key(&entity_id), StoredValue::Sealed(record)));
        }
        self.shared.store.replace_all(entries).await?;

        {
            let mut state = self.state();
            state.has_salt = true;
            state.has_stored_secrets = true;
            state.initialized = true;
        }
        self.publish();

        tracing::info!(count, "imported vault export");
        Ok(())
    }

    // -- Internal helpers ---------------------------------------------------

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_key(&self) -> Result<(SecretKey, u64)> {
        let state = self.state();
        match &state.master_key {
            Some(key) => Ok((key.clone(), state.generation)),
            None => Err(VaultError::Locked),
        }
    }

    fn publish(&self) {
        self.shared.events.send_replace(self.snapshot());
    }

    fn lock_with_reason(&self, reason: &'static str) {
        self.shared.timer.disarm();

        let was_unlocked = {
            let mut state = self.state();
            let was_unlocked = state.is_unlocked();
            state.wipe();
            was_unlocked
        };
        self.clear_session_record();

        if was_unlocked {
            tracing::info!(reason, "vault locked");
            self.publish();
        }
    }

    fn arm_timer(&self) {
        let shared = Arc::downgrade(&self.shared);
        self.shared.timer.arm(move || {
            if let Some(shared) = shared.upgrade() {
                Vault { shared }.lock_with_reason("auto-lock");
            }
        });
    }

    async fn load_persisted_state(&self) -> Result<()> {
        let has_salt = self.read_salt().await?.is_some();
        let entity_count = self
            .shared
            .store
            .keys_with_prefix(ENTITY_PREFIX)
            .await?
            .len();

        if !has_salt && entity_count > 0 {
            tracing::warn!(
                entity_count,
                "app records exist without a salt and cannot be decrypted"
            );
        }

        {
            let mut state = self.state();
            state.has_salt = has_salt;
            state.has_stored_secrets = has_salt || entity_count > 0;
            state.initialized = true;
        }

        tracing::debug!(has_salt, entity_count, "loaded persisted vault state");
        Ok(())
    }

    async fn derive_key(&self, password: &str, salt: Vec<u8>) -> Result<SecretKey> {
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let params = self.shared.config.kdf;
        tokio::task::spawn_blocking(move || {
            crypto::derive_master_key_with(&password, &salt, &params)
        })
        .await?
    }

    /// Authenticate `candidate` against the first stored app record.
    async fn verify_candidate(&self, candidate: &SecretKey) -> Result<bool> {
        let keys = self.shared.store.keys_with_prefix(ENTITY_PREFIX).await?;
        let Some((key, entity_id)) = keys
            .iter()
            .find_map(|key| entity_id_from_key(key).map(|id| (key, id)))
        else {
            tracing::debug!("no app records to verify against, accepting password");
            return Ok(true);
        };

        let Some(record) = self.read_record(key).await? else {
            return Ok(true);
        };

        match decrypt_record(candidate, entity_id, &record) {
            Ok(_) => Ok(true),
            Err(e) if e.is_authentication_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn install_key(&self, key: SecretKey, remember_session: bool) -> Result<()> {
        let remember_session = remember_session && self.write_session_record(&key)?;
        if !remember_session {
            self.clear_session_record();
        }

        self.state().install(key);
        self.arm_timer();
        self.publish();
        Ok(())
    }

    async fn load_bundle(
        &self,
        key: &SecretKey,
        generation: u64,
        entity_id: &str,
    ) -> Result<Option<SecretBundle>> {
        let cached = self.state().cache.get(entity_id).cloned();
        if let Some(bundle) = cached {
            tracing::debug!(entity_id = %entity_id, "bundle cache hit");
            return Ok(Some(bundle));
        }

        let Some(record) = self.read_record(&entity_key(entity_id)).await? else {
            tracing::debug!(entity_id = %entity_id, "no stored record");
            return Ok(None);
        };

        let bundle = open_bundle(key, entity_id, &record)?;
        tracing::debug!(entity_id = %entity_id, "decrypted and cached bundle");

        let mut state = self.state();
        if state.generation == generation && state.is_unlocked() {
            state.cache.insert(entity_id.to_string(), bundle.clone());
        }
        Ok(Some(bundle))
    }

    async fn read_salt(&self) -> Result<Option<[u8; SALT_LEN]>> {
        match self.shared.store.get(SALT_KEY).await? {
            None => Ok(None),
            Some(StoredValue::Bytes(bytes)) => {
                let salt: [u8; SALT_LEN] =
                    bytes.try_into().map_err(|v: Vec<u8>| VaultError::InvalidRecord {
                        key: SALT_KEY.into(),
                        reason: format!("salt must be {SALT_LEN} bytes, got {}", v.len()),
                    })?;
                Ok(Some(salt))
            }
            Some(StoredValue::Sealed(_)) => Err(VaultError::InvalidRecord {
                key: SALT_KEY.into(),
                reason: "expected raw salt bytes, found a sealed record".into(),
            }),
        }
    }

    async fn read_record(&self, key: &str) -> Result<Option<SealedRecord>> {
        match self.shared.store.get(key).await? {
            None => Ok(None),
            Some(StoredValue::Sealed(record)) => Ok(Some(record)),
            Some(StoredValue::Bytes(_)) => Err(VaultError::InvalidRecord {
                key: key.to_string(),
                reason: "expected a sealed record, found raw bytes".into(),
            }),
        }
    }

    // -- Session continuity -------------------------------------------------

    /// Returns `Ok(false)` when no session storage is configured.
    fn write_session_record(&self, key: &SecretKey) -> Result<bool> {
        let Some(storage) = &self.shared.session else {
            tracing::warn!("session continuity requested but no session storage is configured");
            return Ok(false);
        };

        let record = SessionRecord::seal(key)?;
        storage.set_item(SESSION_STORAGE_KEY, &record.to_json()?)?;
        tracing::debug!("wrote session continuity record");
        Ok(true)
    }

    fn clear_session_record(&self) {
        if let Some(storage) = &self.shared.session {
            if let Err(e) = storage.remove_item(SESSION_STORAGE_KEY) {
                tracing::warn!(error = %e, "failed to remove session continuity record");
            }
        }
    }

    fn restore_session(&self) {
        let Some(storage) = &self.shared.session else {
            return;
        };

        let json = match storage.get_item(SESSION_STORAGE_KEY) {
            Ok(Some(json)) => json,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read session continuity record");
                return;
            }
        };

        if !self.state().has_salt {
            tracing::warn!("discarding session record: vault has no salt");
            self.clear_session_record();
            return;
        }

        match SessionRecord::from_json(&json).and_then(|record| record.open()) {
            Ok(key) => {
                self.state().install(key);
                self.arm_timer();
                tracing::info!("vault restored from session continuity record");
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable session record");
                self.clear_session_record();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Record sealing
// ---------------------------------------------------------------------------

fn seal_bundle(master_key: &SecretKey, entity_id: &str, bundle: &SecretBundle) -> Result<SealedRecord> {
    let dek = crypto::derive_entity_key(master_key, entity_id)?;
    let plaintext = bundle.to_plaintext()?;
    let (nonce, ciphertext) = crypto::encrypt(&plaintext, &dek)?;
    drop(dek);

    Ok(SealedRecord {
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

fn decrypt_record(
    master_key: &SecretKey,
    entity_id: &str,
    record: &SealedRecord,
) -> Result<Zeroizing<Vec<u8>>> {
    let nonce: [u8; NONCE_LEN] =
        record
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidRecord {
                key: entity_key(entity_id),
                reason: format!(
                    "nonce must be {NONCE_LEN} bytes, got {}",
                    record.nonce.len()
                ),
            })?;

    let dek = crypto::derive_entity_key(master_key, entity_id)?;
    let plaintext = crypto::decrypt(&nonce, &record.ciphertext, &dek);
    drop(dek);

    plaintext.map_err(|e| match e {
        VaultError::AuthenticationFailed { .. } => VaultError::AuthenticationFailed {
            context: format!("app '{entity_id}': wrong key or corrupted record"),
        },
        other => other,
    })
}

fn open_bundle(master_key: &SecretKey, entity_id: &str, record: &SealedRecord) -> Result<SecretBundle> {
    let plaintext = decrypt_record(master_key, entity_id, record)?;
    SecretBundle::from_plaintext(&entity_key(entity_id), &plaintext)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::KdfParams;
    use crate::session::MemorySessionStorage;
    use crate::store::MemoryStore;

    const PASSWORD: &str = "Str0ng!Passw0rd12";

    fn test_config() -> VaultConfig {
        VaultConfig {
            kdf: KdfParams {
                memory_kib: 256,
                iterations: 1,
                parallelism: 1,
            },
            auto_lock_secs: 900,
        }
    }

    async fn test_vault() -> (Vault, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let vault = Vault::new(store.clone(), test_config());
        vault.initialize().await.unwrap();
        (vault, store)
    }

    #[tokio::test]
    async fn fresh_vault_is_uninitialized() {
        let (vault, _) = test_vault().await;
        assert_eq!(vault.status(), VaultStatus::Uninitialized);
        assert!(vault.is_locked());
        assert!(!vault.has_stored_secrets());
    }

    #[tokio::test]
    async fn first_unlock_persists_salt() {
        let (vault, store) = test_vault().await;
        assert!(vault.unlock(PASSWORD).await.unwrap());
        assert_eq!(vault.status(), VaultStatus::Unlocked);

        let salt = store.get(SALT_KEY).await.unwrap().unwrap();
        assert_eq!(salt.as_bytes().unwrap().len(), SALT_LEN);
    }

    #[tokio::test]
    async fn locked_get_returns_none() {
        let (vault, _) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();
        vault.lock();

        assert_eq!(vault.get_secret("app1", "client_secret").await.unwrap(), None);
        assert!(vault.get_bundle("app1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_entity_and_field_are_none() {
        let (vault, _) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();

        assert_eq!(vault.get_secret("nope", "client_secret").await.unwrap(), None);
        assert_eq!(vault.get_secret("app1", "other_field").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_secret_merges_fields() {
        let (vault, _) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();

        vault
            .set_secret("app1", [("client_secret", "abc"), ("signing_key", "k1")])
            .await
            .unwrap();
        vault.set_secret("app1", [("client_secret", "xyz")]).await.unwrap();

        let bundle = vault.get_bundle("app1").await.unwrap().unwrap();
        assert_eq!(bundle.get("client_secret"), Some("xyz"));
        assert_eq!(bundle.get("signing_key"), Some("k1"));
    }

    #[tokio::test]
    async fn set_secret_uses_fresh_nonce() {
        let (vault, store) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();

        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();
        let first = store.get("app:app1").await.unwrap().unwrap().into_sealed().unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();
        let second = store.get("app:app1").await.unwrap().unwrap().into_sealed().unwrap();

        assert_ne!(first.nonce, second.nonce);
    }

    #[tokio::test]
    async fn lock_is_idempotent() {
        let (vault, _) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();

        vault.lock();
        vault.lock();

        assert!(vault.is_locked());
        assert_eq!(vault.status(), VaultStatus::Locked);
        assert!(vault.state().cache.is_empty());
        assert!(!vault.shared.timer.is_armed());
    }

    #[tokio::test]
    async fn remove_last_secret_clears_flag() {
        let (vault, store) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();
        vault.set_secret("app2", [("client_secret", "def")]).await.unwrap();

        vault.remove_secret("app1").await.unwrap();
        assert!(vault.has_stored_secrets());
        assert!(store.get("app:app1").await.unwrap().is_none());
        assert_eq!(vault.get_secret("app1", "client_secret").await.unwrap(), None);

        vault.remove_secret("app2").await.unwrap();
        assert!(!vault.has_stored_secrets());
        assert_eq!(vault.list_entities().await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn salt_without_records_accepts_any_password() {
        let (vault, store) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.lock();

        let reloaded = Vault::new(store, test_config());
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.status(), VaultStatus::Locked);
        assert!(reloaded.unlock("anything at all").await.unwrap());
    }

    #[tokio::test]
    async fn unlock_without_initialize_loads_state() {
        let (vault, store) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();

        let reloaded = Vault::new(store, test_config());
        assert!(!reloaded.unlock("wrong").await.unwrap());
        assert!(reloaded.unlock(PASSWORD).await.unwrap());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let (vault, _) = test_vault().await;
        let mut events = vault.subscribe();

        vault.unlock(PASSWORD).await.unwrap();
        events.changed().await.unwrap();
        assert_eq!(events.borrow_and_update().status, VaultStatus::Unlocked);

        vault.lock();
        events.changed().await.unwrap();
        assert_eq!(events.borrow_and_update().status, VaultStatus::Locked);
    }

    #[tokio::test]
    async fn failed_unlock_locks_an_unlocked_vault() {
        let (vault, _) = test_vault().await;
        vault.unlock(PASSWORD).await.unwrap();
        vault.set_secret("app1", [("client_secret", "abc")]).await.unwrap();

        assert!(!vault.unlock("wrong").await.unwrap());
        assert!(vault.is_locked());
        assert!(vault.state().cache.is_empty());
        assert!(!vault.shared.timer.is_armed());
        assert_eq!(vault.get_secret("app1", "client_secret").await.unwrap(), None);

        assert!(vault.unlock(PASSWORD).await.unwrap());
        assert_eq!(
            vault.get_secret("app1", "client_secret").await.unwrap().as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn remember_session_without_storage_still_unlocks() {
        let (vault, _) = test_vault().await;
        let unlocked = vault
            .unlock_with(PASSWORD, UnlockOptions { remember_session: true })
            .await
            .unwrap();
        assert!(unlocked);
        assert!(!vault.is_locked());
    }

    #[tokio::test]
    async fn session_record_written_only_on_opt_in() {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(MemorySessionStorage::new());
        let vault = Vault::builder(store)
            .config(test_config())
            .session_storage(session.clone())
            .build();
        vault.initialize().await.unwrap();

        vault.unlock(PASSWORD).await.unwrap();
        assert!(session.get_item(SESSION_STORAGE_KEY).unwrap().is_none());

        vault
            .unlock_with(PASSWORD, UnlockOptions { remember_session: true })
            .await
            .unwrap();
        assert!(session.get_item(SESSION_STORAGE_KEY).unwrap().is_some());

        vault.lock();
        assert!(session.get_item(SESSION_STORAGE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_length_salt_is_invalid_record() {
        let store = Arc::new(MemoryStore::new());
        store.put(SALT_KEY, StoredValue::Bytes(vec![0; 4])).await.unwrap();

        let vault = Vault::new(store, test_config());
        let err = vault.initialize().await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidRecord { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_activity_is_ignored_while_locked() {
        let (vault, _) = test_vault().await;
        vault.notify_activity();
        assert!(!vault.shared.timer.is_armed());

        vault.unlock(PASSWORD).await.unwrap();
        assert!(vault.shared.timer.is_armed());
        tokio::time::sleep(Duration::from_secs(901)).await;
        assert!(vault.is_locked());
    }
}
