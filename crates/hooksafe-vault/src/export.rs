//! Portable backup format for the encrypted-at-rest material.
//!
//! ```json
//! {
//!   "version": 3,
//!   "salt": "<base64, 16 bytes>",
//!   "apps": {
//!     "<entity id>": { "nonce": "<base64, 24 bytes>", "ciphertext": "<base64>" }
//!   }
//! }
//! ```
//!
//! Only ciphertext leaves the vault. Parsing is strict: a wrong version, a
//! missing salt, bad base64, or a wrong-length salt or nonce rejects the whole
//! file before anything is written.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::{NONCE_LEN, SALT_LEN};
use crate::error::{Result, VaultError};
use crate::store::SealedRecord;

/// The only export format version this crate reads or writes.
pub const EXPORT_VERSION: u32 = 3;

/// One app's sealed record in an export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedApp {
    pub nonce: String,
    pub ciphertext: String,
}

/// A complete vault export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultExport {
    pub version: u32,
    pub salt: String,
    pub apps: BTreeMap<String, ExportedApp>,
}

/// Lenient mirror of [`VaultExport`] so missing fields produce a specific
/// message instead of a generic serde error.
#[derive(Deserialize)]
struct RawExport {
    version: Option<serde_json::Value>,
    salt: Option<String>,
    #[serde(default)]
    apps: BTreeMap<String, ExportedApp>,
}

/// Salt and records decoded from an export, ready to be written to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedExport {
    pub salt: [u8; SALT_LEN],
    pub apps: Vec<(String, SealedRecord)>,
}

impl VaultExport {
    /// Build an export from raw store contents.
    pub fn from_parts<'a>(
        salt: &[u8],
        apps: impl IntoIterator<Item = (&'a str, &'a SealedRecord)>,
    ) -> Self {
        let apps = apps
            .into_iter()
            .map(|(id, record)| {
                (
                    id.to_string(),
                    ExportedApp {
                        nonce: BASE64.encode(&record.nonce),
                        ciphertext: BASE64.encode(&record.ciphertext),
                    },
                )
            })
            .collect();

        Self {
            version: EXPORT_VERSION,
            salt: BASE64.encode(salt),
            apps,
        }
    }

    /// Parse and validate an export file.
    ///
    /// # Errors
    ///
    /// [`VaultError::ImportFormat`] naming the first problem found.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawExport = serde_json::from_str(json).map_err(|e| VaultError::ImportFormat {
            reason: format!("not a valid export file: {e}"),
        })?;

        let version = match raw.version {
            Some(serde_json::Value::Number(n)) if n.as_u64() == Some(EXPORT_VERSION as u64) => {
                EXPORT_VERSION
            }
            Some(other) => {
                return Err(VaultError::ImportFormat {
                    reason: format!("unsupported version {other}, expected {EXPORT_VERSION}"),
                });
            }
            None => {
                return Err(VaultError::ImportFormat {
                    reason: "missing required field 'version'".into(),
                });
            }
        };

        let salt = raw.salt.ok_or_else(|| VaultError::ImportFormat {
            reason: "missing required field 'salt'".into(),
        })?;

        let export = Self {
            version,
            salt,
            apps: raw.apps,
        };
        export.decode()?;
        Ok(export)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode the base64 fields and check their lengths.
    pub fn decode(&self) -> Result<DecodedExport> {
        if self.version != EXPORT_VERSION {
            return Err(VaultError::ImportFormat {
                reason: format!(
                    "unsupported version {}, expected {EXPORT_VERSION}",
                    self.version
                ),
            });
        }

        let salt: [u8; SALT_LEN] = decode_b64("salt", &self.salt)?
            .try_into()
            .map_err(|v: Vec<u8>| VaultError::ImportFormat {
                reason: format!("salt must be {SALT_LEN} bytes, got {}", v.len()),
            })?;

        let mut apps = Vec::with_capacity(self.apps.len());
        for (id, app) in &self.apps {
            if id.is_empty() {
                return Err(VaultError::ImportFormat {
                    reason: "app id must not be empty".into(),
                });
            }

            let nonce = decode_b64(&format!("apps.{id}.nonce"), &app.nonce)?;
            if nonce.len() != NONCE_LEN {
                return Err(VaultError::ImportFormat {
                    reason: format!(
                        "apps.{id}.nonce must be {NONCE_LEN} bytes, got {}",
                        nonce.len()
                    ),
                });
            }
            let ciphertext = decode_b64(&format!("apps.{id}.ciphertext"), &app.ciphertext)?;

            apps.push((id.clone(), SealedRecord { nonce, ciphertext }));
        }

        Ok(DecodedExport { salt, apps })
    }
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64.decode(value).map_err(|e| VaultError::ImportFormat {
        reason: format!("{field} is not valid base64: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VaultExport {
        let record = SealedRecord {
            nonce: vec![3; NONCE_LEN],
            ciphertext: vec![4; 40],
        };
        VaultExport::from_parts(&[1; SALT_LEN], [("app1", &record)])
    }

    fn reason(err: VaultError) -> String {
        match err {
            VaultError::ImportFormat { reason } => reason,
            other => panic!("expected ImportFormat, got {other:?}"),
        }
    }

    #[test]
    fn json_shape_matches_format() {
        let json = sample().to_json_pretty().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["version"], 3);
        assert_eq!(value["salt"], BASE64.encode([1u8; SALT_LEN]));
        assert!(value["apps"]["app1"]["nonce"].is_string());
        assert!(value["apps"]["app1"]["ciphertext"].is_string());
    }

    #[test]
    fn parse_accepts_own_output() {
        let export = sample();
        let parsed = VaultExport::from_json(&export.to_json_pretty().unwrap()).unwrap();
        assert_eq!(parsed, export);

        let decoded = parsed.decode().unwrap();
        assert_eq!(decoded.salt, [1; SALT_LEN]);
        assert_eq!(decoded.apps[0].0, "app1");
        assert_eq!(decoded.apps[0].1.ciphertext, vec![4; 40]);
    }

    #[test]
    fn rejects_other_versions() {
        let msg = reason(VaultExport::from_json(r#"{"version":2,"salt":"AAAA","apps":{}}"#).unwrap_err());
        assert!(msg.contains("unsupported version 2"));

        let msg = reason(VaultExport::from_json(r#"{"version":"3","salt":"AAAA"}"#).unwrap_err());
        assert!(msg.contains("unsupported version"));
    }

    #[test]
    fn rejects_missing_fields() {
        let msg = reason(VaultExport::from_json(r#"{"salt":"AAAA"}"#).unwrap_err());
        assert!(msg.contains("'version'"));

        let msg = reason(VaultExport::from_json(r#"{"version":3,"apps":{}}"#).unwrap_err());
        assert!(msg.contains("'salt'"));
    }

    #[test]
    fn rejects_bad_lengths_and_base64() {
        let msg = reason(VaultExport::from_json(r#"{"version":3,"salt":"AAAA"}"#).unwrap_err());
        assert!(msg.contains("salt must be 16 bytes"));

        let salt = BASE64.encode([0u8; SALT_LEN]);
        let json = format!(
            r#"{{"version":3,"salt":"{salt}","apps":{{"a":{{"nonce":"AAAA","ciphertext":""}}}}}}"#
        );
        let msg = reason(VaultExport::from_json(&json).unwrap_err());
        assert!(msg.contains("apps.a.nonce must be 24 bytes"));

        let json = format!(
            r#"{{"version":3,"salt":"{salt}","apps":{{"a":{{"nonce":"%%%","ciphertext":""}}}}}}"#
        );
        let msg = reason(VaultExport::from_json(&json).unwrap_err());
        assert!(msg.contains("not valid base64"));
    }

    #[test]
    fn apps_may_be_absent() {
        let salt = BASE64.encode([0u8; SALT_LEN]);
        let export = VaultExport::from_json(&format!(r#"{{"version":3,"salt":"{salt}"}}"#)).unwrap();
        assert!(export.apps.is_empty());
    }
}
