//! Cryptographic primitives for the vault.
//!
//! - **Password KDF**: Argon2id (64 MiB, 3 passes, 1 lane) turns a password
//!   and a 16-byte salt into the 256-bit master key.
//! - **Per-app keys**: keyed BLAKE2b-256 over the app id, keyed by the master
//!   key. Every app gets its own data encryption key (DEK).
//! - **AEAD**: XSalsa20-Poly1305 (NaCl `secretbox`) with a fresh random
//!   192-bit nonce per encryption.
//! - **Zeroing**: key material lives in [`SecretKey`], which wipes itself on
//!   drop, and [`secure_zero`] wipes arbitrary buffers.
//!
//! # Security Notes
//!
//! - 192-bit random nonces make collisions negligible no matter how many
//!   times one DEK is reused.
//! - Zeroing is best effort. The allocator, moves, and the optimiser may
//!   leave copies behind.

use argon2::{Algorithm, Argon2, Params, Version};
use blake2::Blake2bMac;
use blake2::digest::Mac;
use blake2::digest::consts::U32;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, VaultError};

/// Length of every symmetric key in bytes (master key, DEK, session key).
pub const KEY_LEN: usize = 32;

/// Length of the XSalsa20-Poly1305 nonce in bytes.
pub const NONCE_LEN: usize = 24;

/// Length of the Argon2id salt in bytes.
pub const SALT_LEN: usize = 16;

/// Length of the Poly1305 tag prepended to every ciphertext.
pub const MAC_LEN: usize = 16;

type Blake2bMac256 = Blake2bMac<U32>;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// A 256-bit symmetric key that is zeroed when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Copy a key out of a slice, rejecting the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| VaultError::EncryptionFailed {
            reason: format!("key must be {KEY_LEN} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(array))
    }

    /// Generate a fresh random key.
    pub fn generate() -> Result<Self> {
        let mut key = Self([0u8; KEY_LEN]);
        fill_random(&mut key.0)?;
        Ok(key)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Argon2id parameters
// ---------------------------------------------------------------------------

/// Cost parameters for the Argon2id password KDF.
///
/// The default is the production setting: 64 MiB, 3 iterations, 1 lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes over memory.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive the master key from `password` and `salt` with the default
/// Argon2id parameters.
///
/// # Errors
///
/// Returns [`VaultError::KeyDerivationFailed`] if `salt` is not exactly
/// [`SALT_LEN`] bytes.
pub fn derive_master_key(password: &[u8], salt: &[u8]) -> Result<SecretKey> {
    derive_master_key_with(password, salt, &KdfParams::default())
}

/// Derive the master key with explicit Argon2id cost parameters.
///
/// Deterministic: the same password, salt and parameters always produce the
/// same key. This is CPU and memory heavy; async callers should run it on a
/// blocking thread.
pub fn derive_master_key_with(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<SecretKey> {
    if salt.len() != SALT_LEN {
        return Err(VaultError::KeyDerivationFailed {
            reason: format!("salt must be {SALT_LEN} bytes, got {}", salt.len()),
        });
    }

    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::KeyDerivationFailed {
        reason: e.to_string(),
    })?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = SecretKey([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, salt, &mut key.0)
        .map_err(|e| VaultError::KeyDerivationFailed {
            reason: e.to_string(),
        })?;

    tracing::debug!(
        memory_kib = params.memory_kib,
        iterations = params.iterations,
        "derived master key via Argon2id"
    );

    Ok(key)
}

/// Derive the data encryption key for one app from the master key.
///
/// Computes keyed BLAKE2b with a 32-byte output over the UTF-8 bytes of
/// `entity_id`, keyed by `master_key`. The result is rederived on every use
/// and never stored.
pub fn derive_entity_key(master_key: &SecretKey, entity_id: &str) -> Result<SecretKey> {
    let mut mac = <Blake2bMac256 as Mac>::new_from_slice(master_key.as_bytes()).map_err(|_| {
        VaultError::KeyDerivationFailed {
            reason: "invalid BLAKE2b key length".into(),
        }
    })?;
    mac.update(entity_id.as_bytes());

    let mut output = mac.finalize().into_bytes();
    let mut key = SecretKey([0u8; KEY_LEN]);
    key.0.copy_from_slice(&output);
    output.as_mut_slice().zeroize();

    Ok(key)
}

// ---------------------------------------------------------------------------
// Authenticated encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with XSalsa20-Poly1305 under `key`.
///
/// Returns `(nonce, ciphertext)` where `nonce` is freshly random and
/// `ciphertext` is the Poly1305 tag followed by the encrypted bytes.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if the CSPRNG fails.
pub fn encrypt(plaintext: &[u8], key: &SecretKey) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce).map_err(|_| VaultError::EncryptionFailed {
        reason: "failed to generate random nonce".into(),
    })?;

    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
        VaultError::EncryptionFailed {
            reason: "failed to create XSalsa20-Poly1305 key".into(),
        }
    })?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "secretbox seal failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = ciphertext.len(),
        "encrypted data"
    );

    Ok((nonce, ciphertext))
}

/// Decrypt and authenticate `ciphertext` produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`VaultError::AuthenticationFailed`] if the tag does not verify.
/// A wrong key, a flipped ciphertext bit and a flipped nonce bit all look the
/// same.
pub fn decrypt(
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    key: &SecretKey,
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
        VaultError::AuthenticationFailed {
            context: "failed to create XSalsa20-Poly1305 key".into(),
        }
    })?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::AuthenticationFailed {
            context: "wrong key or corrupted data".into(),
        })?;

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        plaintext_len = plaintext.len(),
        "decrypted data"
    );

    Ok(Zeroizing::new(plaintext))
}

// ---------------------------------------------------------------------------
// Zeroing and randomness
// ---------------------------------------------------------------------------

/// Overwrite `buf` with zeros in a way the optimiser will not elide.
///
/// Best effort only: earlier copies made by moves or reallocations are out of
/// reach.
pub fn secure_zero(buf: &mut [u8]) {
    buf.zeroize();
}

/// Fill `buf` from the system CSPRNG.
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))
}

/// Generate a fresh Argon2id salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    Ok(salt)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SecretKey::generate().unwrap();
        let plaintext = b"{\"client_secret\":\"abc\"}";

        let (nonce, ciphertext) = encrypt(plaintext, &key).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + MAC_LEN);

        let decrypted = decrypt(&nonce, &ciphertext, &key).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn nonces_are_fresh() {
        let key = SecretKey::generate().unwrap();
        let (n1, c1) = encrypt(b"same", &key).unwrap();
        let (n2, c2) = encrypt(b"same", &key).unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key1 = SecretKey::generate().unwrap();
        let key2 = SecretKey::generate().unwrap();

        let (nonce, ciphertext) = encrypt(b"secret data", &key1).unwrap();
        let err = decrypt(&nonce, &ciphertext, &key2).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn decrypt_with_tampered_ciphertext_fails() {
        let key = SecretKey::generate().unwrap();
        let (nonce, ciphertext) = encrypt(b"secret data", &key).unwrap();

        for i in 0..ciphertext.len() {
            let mut tampered = ciphertext.clone();
            tampered[i] ^= 0x01;
            let err = decrypt(&nonce, &tampered, &key).unwrap_err();
            assert!(err.is_authentication_failure(), "byte {i}");
        }
    }

    #[test]
    fn decrypt_with_tampered_nonce_fails() {
        let key = SecretKey::generate().unwrap();
        let (mut nonce, ciphertext) = encrypt(b"secret data", &key).unwrap();
        nonce[NONCE_LEN - 1] ^= 0x80;

        let err = decrypt(&nonce, &ciphertext, &key).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = SecretKey::generate().unwrap();
        let (nonce, ciphertext) = encrypt(b"x", &key).unwrap();
        let err = decrypt(&nonce, &ciphertext[..MAC_LEN - 1], &key).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn master_key_is_deterministic() {
        let salt = generate_salt().unwrap();
        let k1 = derive_master_key_with(b"Str0ng!Passw0rd12", &salt, &fast_params()).unwrap();
        let k2 = derive_master_key_with(b"Str0ng!Passw0rd12", &salt, &fast_params()).unwrap();
        assert_eq!(k1, k2);

        let other = derive_master_key_with(b"wrong", &salt, &fast_params()).unwrap();
        assert_ne!(k1, other);

        let other_salt = generate_salt().unwrap();
        let k3 = derive_master_key_with(b"Str0ng!Passw0rd12", &other_salt, &fast_params()).unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn master_key_rejects_bad_salt_length() {
        let err = derive_master_key_with(b"pw", &[0u8; 8], &fast_params()).unwrap_err();
        assert!(matches!(err, VaultError::KeyDerivationFailed { .. }));
    }

    #[test]
    fn default_params_match_production_setting() {
        let params = KdfParams::default();
        assert_eq!(params.memory_kib, 65_536);
        assert_eq!(params.iterations, 3);
        assert_eq!(params.parallelism, 1);
    }

    #[test]
    fn entity_keys_are_deterministic_and_isolated() {
        let master = SecretKey::generate().unwrap();

        let a1 = derive_entity_key(&master, "app1").unwrap();
        let a2 = derive_entity_key(&master, "app1").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(&a1, &master);

        let mut seen = HashSet::new();
        for i in 0..2_000 {
            let dek = derive_entity_key(&master, &format!("app-{i}")).unwrap();
            assert!(seen.insert(*dek.as_bytes()), "collision at app-{i}");
        }
    }

    #[test]
    fn entity_keys_depend_on_master_key() {
        let m1 = SecretKey::generate().unwrap();
        let m2 = SecretKey::generate().unwrap();
        assert_ne!(
            derive_entity_key(&m1, "app1").unwrap(),
            derive_entity_key(&m2, "app1").unwrap()
        );
    }

    #[test]
    fn secure_zero_wipes_buffer() {
        let mut buf = [0u8; 64];
        fill_random(&mut buf).unwrap();
        buf[0] = 0xFF;
        secure_zero(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn secret_key_debug_is_redacted() {
        let key = SecretKey::from_slice(&[7u8; KEY_LEN]).unwrap();
        assert_eq!(format!("{key:?}"), "SecretKey(..)");
    }

    #[test]
    fn secret_key_from_slice_checks_length() {
        assert!(SecretKey::from_slice(&[0u8; 31]).is_err());
        assert!(SecretKey::from_slice(&[0u8; KEY_LEN]).is_ok());
    }
}
