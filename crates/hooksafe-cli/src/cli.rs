//! CLI argument definitions for hooksafe.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// hooksafe -- encrypted storage for webhook app credentials.
#[derive(Parser)]
#[command(
    name = "hooksafe",
    version,
    about = "hooksafe -- encrypted storage for webhook app credentials",
    long_about = "Stores per-app secrets (client secrets, signing keys) encrypted under a \
                  master password. Only ciphertext is ever written to disk."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "hooksafe.toml")]
    pub config: PathBuf,

    /// Override the database path from the configuration file.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show whether the vault is set up and how many apps it holds.
    Status,

    /// List the ids of all apps with stored secrets.
    List,

    /// Print one secret field of an app.
    Get {
        /// App id.
        app: String,

        /// Field name, e.g. `client_secret`.
        field: String,
    },

    /// Set one or more secret fields of an app.
    Set {
        /// App id.
        app: String,

        /// Fields to set, as `name=value`.
        #[arg(required = true, value_parser = parse_field_assignment)]
        fields: Vec<(String, String)>,
    },

    /// Delete all secrets of an app.
    Remove {
        /// App id.
        app: String,
    },

    /// Re-encrypt everything under a new master password.
    ChangePassword,

    /// Write the encrypted vault contents to a JSON file.
    Export {
        /// Destination file.
        file: PathBuf,
    },

    /// Replace the vault contents with a previously exported file.
    Import {
        /// Source file.
        file: PathBuf,
    },

    /// Permanently delete the salt and every stored secret.
    Reset {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

/// Parse a `name=value` argument. The value may itself contain `=`.
pub fn parse_field_assignment(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected `name=value`, got `{s}`"))?;
    if name.is_empty() {
        return Err(format!("field name is empty in `{s}`"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_assignment_splits_on_first_equals() {
        assert_eq!(
            parse_field_assignment("client_secret=a=b").unwrap(),
            ("client_secret".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_field_assignment("empty=").unwrap(),
            ("empty".to_string(), String::new())
        );
    }

    #[test]
    fn field_assignment_rejects_malformed() {
        assert!(parse_field_assignment("no-equals").is_err());
        assert!(parse_field_assignment("=value").is_err());
    }

    #[test]
    fn parses_set_with_global_flags() {
        let cli = Cli::try_parse_from([
            "hooksafe",
            "--db",
            "/tmp/x.db",
            "set",
            "app1",
            "client_secret=abc",
            "signing_key=k",
        ])
        .unwrap();

        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::Set { app, fields } => {
                assert_eq!(app, "app1");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[1], ("signing_key".to_string(), "k".to_string()));
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn set_requires_a_field() {
        assert!(Cli::try_parse_from(["hooksafe", "set", "app1"]).is_err());
    }
}
