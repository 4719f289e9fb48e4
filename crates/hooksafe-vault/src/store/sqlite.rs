//! SQLite-backed [`SecretStore`].
//!
//! All records live in one table:
//!
//! ```text
//! vault_records(key TEXT PRIMARY KEY, kind TEXT, data BLOB, nonce BLOB, updated_at INTEGER)
//! ```
//!
//! `kind` is `'bytes'` for the salt and `'sealed'` for per-app records.
//! Ciphertexts and nonces are stored as raw BLOBs, never as base64 text.
//!
//! The connection sits behind an `Arc<Mutex<>>` and every operation is
//! dispatched onto the blocking pool via `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{SealedRecord, SecretStore, StoredValue};
use crate::error::{StoreError, StoreResult};

const KIND_BYTES: &str = "bytes";
const KIND_SEALED: &str = "sealed";

/// Thread-safe handle to the vault's SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and create the schema.
    ///
    /// This blocks briefly on file I/O; call it during startup.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening vault store");

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(conn: &Connection) -> StoreResult<()> {
        tracing::debug!("running vault store schema migrations");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vault_records (
                key        TEXT PRIMARY KEY,
                kind       TEXT NOT NULL CHECK(kind IN ('bytes','sealed')),
                data       BLOB NOT NULL,
                nonce      BLOB,
                updated_at INTEGER NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn upsert(conn: &Connection, key: &str, value: &StoredValue, now: i64) -> StoreResult<()> {
    let (kind, data, nonce): (&str, &[u8], Option<&[u8]>) = match value {
        StoredValue::Bytes(bytes) => (KIND_BYTES, bytes.as_slice(), None),
        StoredValue::Sealed(record) => (
            KIND_SEALED,
            record.ciphertext.as_slice(),
            Some(record.nonce.as_slice()),
        ),
    };

    conn.execute(
        "INSERT INTO vault_records (key, kind, data, nonce, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(key) DO UPDATE SET
            kind = excluded.kind,
            data = excluded.data,
            nonce = excluded.nonce,
            updated_at = excluded.updated_at",
        params![key, kind, data, nonce, now],
    )?;
    Ok(())
}

fn row_to_value(
    key: &str,
    kind: String,
    data: Vec<u8>,
    nonce: Option<Vec<u8>>,
) -> StoreResult<StoredValue> {
    match (kind.as_str(), nonce) {
        (KIND_BYTES, _) => Ok(StoredValue::Bytes(data)),
        (KIND_SEALED, Some(nonce)) => Ok(StoredValue::Sealed(SealedRecord {
            nonce,
            ciphertext: data,
        })),
        (KIND_SEALED, None) => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "sealed record has no nonce".into(),
        }),
        (other, _) => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("unknown record kind '{other}'"),
        }),
    }
}

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SecretStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let key = key.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT kind, data, nonce FROM vault_records WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(kind, data, nonce)| row_to_value(&key, kind, data, nonce))
                .transpose()
        })
        .await
    }

    async fn put(&self, key: &str, value: StoredValue) -> StoreResult<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            upsert(conn, &key, &value, Utc::now().timestamp())?;
            tracing::debug!(key = %key, "stored vault record");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            let rows = conn.execute("DELETE FROM vault_records WHERE key = ?1", params![key])?;
            tracing::debug!(key = %key, rows, "deleted vault record");
            Ok(())
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let prefix = prefix.to_string();
        self.execute(move |conn| {
            // substr() compares characters, which sidesteps LIKE escaping.
            let mut stmt = conn.prepare(
                "SELECT key FROM vault_records WHERE substr(key, 1, ?1) = ?2 ORDER BY key",
            )?;
            let len = prefix.chars().count() as i64;
            let keys = stmt
                .query_map(params![len, prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.execute(|conn| {
            let rows = conn.execute("DELETE FROM vault_records", [])?;
            tracing::info!(rows, "cleared vault store");
            Ok(())
        })
        .await
    }

    async fn replace_all(&self, entries: Vec<(String, StoredValue)>) -> StoreResult<()> {
        self.execute(move |conn| {
            let now = Utc::now().timestamp();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM vault_records", [])?;
            for (key, value) in &entries {
                upsert(&tx, key, value, now)?;
            }
            tx.commit()?;

            tracing::info!(count = entries.len(), "replaced vault store contents");
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
