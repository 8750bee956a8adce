use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::KvStore;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_values (
  key TEXT PRIMARY KEY,
  value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_hash_fields (
  key TEXT NOT NULL,
  field BLOB NOT NULL,
  value BLOB NOT NULL,
  PRIMARY KEY (key, field)
) WITHOUT ROWID;
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// `SQLite`-backed store. One connection, serialized behind a mutex; every
/// call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKvStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl SqliteKvStore {
    /// Open a database and configure required runtime pragmas.
    ///
    /// `:memory:` opens a private in-memory database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)), path: path.to_path_buf() })
    }

    /// Open and bring the schema up to date.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer
    /// than this build.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version == 0 {
            conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&conn, 1)?;
            version = 1;
            tracing::debug!(path = %self.path.display(), "applied sqlite migration 001");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .lock()
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    async fn with_conn<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            operation(&mut guard)
        })
        .await
        .context("sqlite worker task failed")?
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM kv_values WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .with_context(|| format!("failed to read value {key}"))
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_values(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("failed to write value {key}"))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("failed to start delete transaction")?;
            tx.execute("DELETE FROM kv_values WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete value {key}"))?;
            tx.execute("DELETE FROM kv_hash_fields WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete hash {key}"))?;
            tx.commit().context("failed to commit delete transaction")
        })
        .await
    }

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let field = field.to_vec();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_hash_fields WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read hash field of {key}"))
        })
        .await
    }

    async fn hmget(&self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let key = key.to_string();
        let fields = fields.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT value FROM kv_hash_fields WHERE key = ?1 AND field = ?2")
                .context("failed to prepare hash field lookup")?;
            let mut values = Vec::with_capacity(fields.len());
            for field in &fields {
                let value = stmt
                    .query_row(params![key, field], |row| row.get::<_, Vec<u8>>(0))
                    .optional()
                    .with_context(|| format!("failed to read hash fields of {key}"))?;
                values.push(value);
            }
            Ok(values)
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT field, value FROM kv_hash_fields WHERE key = ?1")
                .context("failed to prepare hash scan")?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut hash = BTreeMap::new();
            for row in rows {
                let (field, value) = row.with_context(|| format!("failed to scan hash {key}"))?;
                hash.insert(field, value);
            }
            Ok(hash)
        })
        .await
    }

    async fn hset(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("failed to start hash write transaction")?;
            insert_fields(&tx, &key, &entries)?;
            tx.commit().context("failed to commit hash write transaction")
        })
        .await
    }

    async fn hdel(&self, key: &str, fields: &[Vec<u8>]) -> Result<()> {
        let key = key.to_string();
        let fields = fields.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("failed to start hash delete transaction")?;
            {
                let mut stmt = tx
                    .prepare_cached("DELETE FROM kv_hash_fields WHERE key = ?1 AND field = ?2")
                    .context("failed to prepare hash field delete")?;
                for field in &fields {
                    stmt.execute(params![key, field])
                        .with_context(|| format!("failed to delete hash field of {key}"))?;
                }
            }
            tx.commit().context("failed to commit hash delete transaction")
        })
        .await
    }

    async fn replace_hash(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("failed to start hash replace transaction")?;
            tx.execute("DELETE FROM kv_values WHERE key = ?1", params![key])
                .with_context(|| format!("failed to clear value {key}"))?;
            tx.execute("DELETE FROM kv_hash_fields WHERE key = ?1", params![key])
                .with_context(|| format!("failed to clear hash {key}"))?;
            insert_fields(&tx, &key, &entries)?;
            tx.commit().context("failed to commit hash replace transaction")
        })
        .await
    }
}

fn insert_fields(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
    entries: &[(Vec<u8>, Vec<u8>)],
) -> Result<()> {
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO kv_hash_fields(key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
        )
        .context("failed to prepare hash field insert")?;
    for (field, value) in entries {
        stmt.execute(params![key, field, value])
            .with_context(|| format!("failed to write hash field of {key}"))?;
    }
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
