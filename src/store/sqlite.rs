//! SQLite-backed implementation of the key/value store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::{ReadingStore, StoreKey};

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Single-file SQLite store. Writes are serialized behind one connection;
/// the workload is a handful of small upserts per refresh, so a dedicated
/// worker thread is not warranted.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;

        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }

        run_migrations(&mut conn).context("failed to run store migrations")?;

        info!("Reading store initialized at {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadingStore for SqliteStore {
    fn load(&self, key: StoreKey) -> Option<String> {
        let conn = self.lock();
        let result = conn
            .query_row(
                "SELECT payload FROM snapshots WHERE key = ?1",
                params![key.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional();

        match result {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to load {}: {err}", key.as_str());
                None
            }
        }
    }

    fn store(&self, key: StoreKey, payload: &str) {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO snapshots (key, payload, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = ?2, updated_at = ?3",
            params![key.as_str(), payload, Utc::now().to_rfc3339()],
        );

        if let Err(err) = result {
            error!("Failed to store {}: {err}", key.as_str());
        }
    }

    fn clear(&self, key: StoreKey) {
        let conn = self.lock();
        if let Err(err) = conn.execute(
            "DELETE FROM snapshots WHERE key = ?1",
            params![key.as_str()],
        ) {
            error!("Failed to clear {}: {err}", key.as_str());
        }
    }
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "store version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS snapshots (
                    key TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .context("failed to create snapshots table")?;
            Ok(())
        }
        _ => bail!("unknown migration target version: {version}"),
    }
}
