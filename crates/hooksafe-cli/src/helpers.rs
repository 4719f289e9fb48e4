//! Shared helpers for the CLI: tracing, configuration, password prompts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use hooksafe_vault::{SecretBundle, SqliteStore, Vault, VaultConfig, VaultStatus};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Environment variable consulted before prompting for the master password.
pub const PASSWORD_ENV: &str = "HOOKSAFE_PASSWORD";

/// Environment variable consulted before prompting for a new master password.
pub const NEW_PASSWORD_ENV: &str = "HOOKSAFE_NEW_PASSWORD";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Contents of `hooksafe.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub storage: StorageConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hooksafe.db"),
        }
    }
}

impl CliConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse configuration")
    }

    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Open the SQLite store at `db_path` and initialize a vault over it.
pub async fn open_vault(db_path: &Path, config: VaultConfig) -> Result<Vault> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let store = SqliteStore::open(db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let vault = Vault::new(Arc::new(store), config);
    vault
        .initialize()
        .await
        .context("failed to initialize vault")?;

    tracing::debug!(path = %db_path.display(), status = ?vault.status(), "vault opened");
    Ok(vault)
}

/// Unlock `vault`, prompting for the password unless it is set in the
/// environment. On first run the password is asked for twice.
pub async fn unlock(vault: &Vault) -> Result<()> {
    let first_run = vault.status() == VaultStatus::Uninitialized;
    if first_run {
        eprintln!("No vault found. The password you enter becomes the master password.");
    }

    let password = match env_password(PASSWORD_ENV) {
        Some(password) => password,
        None if first_run => prompt_confirmed("Choose master password: ")?,
        None => prompt("Master password: ")?,
    };

    if !vault.unlock(&password).await.context("unlock failed")? {
        bail!("wrong master password");
    }
    Ok(())
}

/// Error text for `get` when `field` is absent, naming the fields that exist.
pub fn missing_field_message(app: &str, field: &str, bundle: &SecretBundle) -> String {
    let available = bundle.field_names().collect::<Vec<_>>().join(", ");
    format!("no field '{field}' stored for app '{app}' (available: {available})")
}

/// The new password for `change-password`.
pub fn new_password() -> Result<Zeroizing<String>> {
    match env_password(NEW_PASSWORD_ENV) {
        Some(password) => Ok(password),
        None => prompt_confirmed("New master password: "),
    }
}

fn env_password(var: &str) -> Option<Zeroizing<String>> {
    std::env::var(var).ok().map(Zeroizing::new)
}

fn prompt(label: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(label)
        .map(Zeroizing::new)
        .context("failed to read password")
}

fn prompt_confirmed(label: &str) -> Result<Zeroizing<String>> {
    let password = prompt(label)?;
    if password.is_empty() {
        bail!("password must not be empty");
    }
    let confirm = prompt("Confirm: ")?;
    if *password != *confirm {
        bail!("passwords do not match");
    }
    Ok(password)
}
