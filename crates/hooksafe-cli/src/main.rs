//! CLI entry point for hooksafe.
//!
//! Each invocation opens the vault, unlocks it when the command needs key
//! material, performs one action, and locks again before exiting.

mod cli;
mod helpers;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hooksafe_vault::{Vault, VaultExport, VaultStatus};

use cli::{Cli, Commands};
use helpers::{CliConfig, init_tracing, missing_field_message, new_password, open_vault, unlock};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("warn");

    let config = CliConfig::load(&cli.config)?;
    let db_path = cli.db.unwrap_or(config.storage.path);
    let vault = open_vault(&db_path, config.vault).await?;

    let result = match cli.command {
        Commands::Status => cmd_status(&vault, &db_path.display().to_string()).await,
        Commands::List => cmd_list(&vault).await,
        Commands::Get { app, field } => cmd_get(&vault, &app, &field).await,
        Commands::Set { app, fields } => cmd_set(&vault, &app, fields).await,
        Commands::Remove { app } => cmd_remove(&vault, &app).await,
        Commands::ChangePassword => cmd_change_password(&vault).await,
        Commands::Export { file } => cmd_export(&vault, &file).await,
        Commands::Import { file } => cmd_import(&vault, &file).await,
        Commands::Reset { yes } => cmd_reset(&vault, yes).await,
    };

    vault.lock();
    result
}

// ---------------------------------------------------------------------------
// Subcommand: status / list
// ---------------------------------------------------------------------------

async fn cmd_status(vault: &Vault, db_path: &str) -> Result<()> {
    let apps = vault.list_entities().await?;

    println!();
    println!("  hooksafe Status");
    println!("  ===============");
    println!();
    println!("  Database:         {db_path}");
    match vault.status() {
        VaultStatus::Uninitialized => {
            println!("  Vault:            NOT SET UP (run `hooksafe set` to create it)")
        }
        VaultStatus::Locked | VaultStatus::Unlocked => println!("  Vault:            OK"),
    }
    println!("  Apps:             {}", apps.len());
    println!();

    Ok(())
}

async fn cmd_list(vault: &Vault) -> Result<()> {
    for app in vault.list_entities().await? {
        println!("{app}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: get / set / remove
// ---------------------------------------------------------------------------

async fn cmd_get(vault: &Vault, app: &str, field: &str) -> Result<()> {
    unlock(vault).await?;

    let Some(bundle) = vault
        .get_bundle(app)
        .await
        .with_context(|| format!("failed to read secrets of '{app}'"))?
    else {
        bail!("no secrets stored for app '{app}'");
    };

    match bundle.get(field) {
        Some(value) => {
            println!("{value}");
            Ok(())
        }
        None => bail!("{}", missing_field_message(app, field, &bundle)),
    }
}

async fn cmd_set(vault: &Vault, app: &str, fields: Vec<(String, String)>) -> Result<()> {
    unlock(vault).await?;

    let count = fields.len();
    vault
        .set_secret(app, fields)
        .await
        .with_context(|| format!("failed to store secrets of '{app}'"))?;

    println!("Stored {count} field(s) for '{app}'.");
    Ok(())
}

async fn cmd_remove(vault: &Vault, app: &str) -> Result<()> {
    unlock(vault).await?;

    vault
        .remove_secret(app)
        .await
        .with_context(|| format!("failed to remove secrets of '{app}'"))?;

    println!("Removed '{app}'.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: change-password
// ---------------------------------------------------------------------------

async fn cmd_change_password(vault: &Vault) -> Result<()> {
    if vault.status() == VaultStatus::Uninitialized {
        bail!("vault is not set up yet");
    }
    unlock(vault).await?;

    let password = new_password()?;
    vault
        .change_master_password(&password)
        .await
        .context("failed to change master password")?;

    println!("Master password changed.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: export / import
// ---------------------------------------------------------------------------

async fn cmd_export(vault: &Vault, file: &std::path::Path) -> Result<()> {
    let export = vault.export().await.context("failed to export vault")?;
    let json = export.to_json_pretty()?;

    std::fs::write(file, json).with_context(|| format!("failed to write {}", file.display()))?;

    println!("Exported {} app(s) to {}.", export.apps.len(), file.display());
    Ok(())
}

async fn cmd_import(vault: &Vault, file: &std::path::Path) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let export = VaultExport::from_json(&json)
        .with_context(|| format!("{} is not a valid export", file.display()))?;

    vault.import(&export).await.context("failed to import vault")?;

    println!(
        "Imported {} app(s). Unlock with the password the export was made under.",
        export.apps.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: reset
// ---------------------------------------------------------------------------

async fn cmd_reset(vault: &Vault, yes: bool) -> Result<()> {
    if !yes {
        bail!("this deletes every stored secret; pass --yes to confirm");
    }

    vault.reset_all().await.context("failed to reset vault")?;

    println!("Vault reset. All secrets deleted.");
    Ok(())
}
