//! The plaintext secret bundle kept per app.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, VaultError};

/// A small map of named secret fields (e.g. `client_secret`) for one app.
///
/// Serialized as a flat JSON object before encryption. Field values are
/// zeroed when the bundle is dropped, and `Debug` prints field names only.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretBundle {
    fields: BTreeMap<String, String>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `field`, if present.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Set `field`, zeroing any value it replaces.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        if let Some(mut old) = self.fields.insert(field.into(), value.into()) {
            old.zeroize();
        }
    }

    /// Overlay `updates` onto this bundle. Fields not named in `updates`
    /// are kept.
    pub fn merge<I, K, V>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (field, value) in updates {
            self.insert(field, value);
        }
    }

    /// Field names in ascending order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn to_plaintext(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    pub(crate) fn from_plaintext(key: &str, plaintext: &[u8]) -> Result<Self> {
        serde_json::from_slice(plaintext).map_err(|e| VaultError::InvalidRecord {
            key: key.to_string(),
            reason: format!("decrypted bundle is not a JSON object of strings: {e}"),
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretBundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bundle = Self::new();
        bundle.merge(iter);
        bundle
    }
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        for value in self.fields.values_mut() {
            value.zeroize();
        }
    }
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.fields.keys()).finish()
    }
}
