//! Vault configuration.
//!
//! Loaded from TOML (usually the `[vault]` table of the application's config
//! file). Every field has a default, so an empty table or a missing file
//! yields the production setting.
//!
//! ```toml
//! auto_lock_secs = 900
//!
//! [kdf]
//! memory_kib = 65536
//! iterations = 3
//! parallelism = 1
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;
use crate::error::{Result, VaultError};

/// Default inactivity timeout before the vault locks itself (15 minutes).
pub const DEFAULT_AUTO_LOCK_SECS: u64 = 15 * 60;

/// Runtime settings for a [`Vault`](crate::Vault).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Argon2id cost parameters used to derive the master key.
    pub kdf: KdfParams,
    /// Seconds of inactivity before auto-lock. `0` disables the timer.
    pub auto_lock_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            auto_lock_secs: DEFAULT_AUTO_LOCK_SECS,
        }
    }
}

impl VaultConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VaultError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Load a configuration file, falling back to defaults if it is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "vault config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| VaultError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;

        tracing::info!(path = %path.display(), "vault configuration loaded");
        Ok(config)
    }

    /// The auto-lock timeout, or `None` when auto-lock is disabled.
    pub fn auto_lock_timeout(&self) -> Option<Duration> {
        (self.auto_lock_secs > 0).then(|| Duration::from_secs(self.auto_lock_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = VaultConfig::from_toml_str("").unwrap();
        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.auto_lock_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn partial_kdf_table_keeps_other_defaults() {
        let config = VaultConfig::from_toml_str(
            "auto_lock_secs = 60\n\n[kdf]\nmemory_kib = 1024\n",
        )
        .unwrap();
        assert_eq!(config.auto_lock_secs, 60);
        assert_eq!(config.kdf.memory_kib, 1024);
        assert_eq!(config.kdf.iterations, 3);
        assert_eq!(config.kdf.parallelism, 1);
    }

    #[test]
    fn zero_disables_auto_lock() {
        let config = VaultConfig {
            auto_lock_secs: 0,
            ..VaultConfig::default()
        };
        assert_eq!(config.auto_lock_timeout(), None);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = VaultConfig::from_toml_str("auto_lock_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, VaultError::Config { .. }));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, VaultConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.toml");
        std::fs::write(&path, "auto_lock_secs = 30\n").unwrap();

        let config = VaultConfig::load(&path).unwrap();
        assert_eq!(config.auto_lock_secs, 30);
    }
}
