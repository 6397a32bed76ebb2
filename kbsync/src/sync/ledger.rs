use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{fs, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Partition of the ledger owned by one (workspace, folder) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncScope {
    pub key: String,
    pub workspace_id: String,
    pub folder_id: Option<String>,
}

impl SyncScope {
    pub fn new(workspace_id: &str, folder_id: Option<&str>) -> Self {
        Self {
            key: format!("{}:{}", workspace_id, folder_id.unwrap_or("root")),
            workspace_id: workspace_id.to_string(),
            folder_id: folder_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub scope: String,
    pub source_id: String,
    pub sink_document_id: String,
    pub document_name: String,
    pub source_path: String,
    pub last_synced_modified_at: Option<i64>,
    pub last_synced_at: i64,
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, LedgerError> {
        Self::open(&default_db_path()?).await
    }

    /// Private database living as long as the store; used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// All entries of one scope keyed by source id.
    pub async fn load_scope(&self, scope: &str) -> Result<HashMap<String, LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT scope, source_id, sink_document_id, document_name, source_path, last_synced_modified_at, last_synced_at
             FROM ledger
             WHERE scope = ?1",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let entry = entry_from_row(&row)?;
            out.insert(entry.source_id.clone(), entry);
        }
        Ok(out)
    }

    pub async fn get(&self, scope: &str, source_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(
            "SELECT scope, source_id, sink_document_id, document_name, source_path, last_synced_modified_at, last_synced_at
             FROM ledger
             WHERE scope = ?1 AND source_id = ?2",
        )
        .bind(scope)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        sqlx::query(
            "
            INSERT INTO ledger (
                scope,
                source_id,
                sink_document_id,
                document_name,
                source_path,
                last_synced_modified_at,
                last_synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(scope, source_id) DO UPDATE SET
                sink_document_id = excluded.sink_document_id,
                document_name = excluded.document_name,
                source_path = excluded.source_path,
                last_synced_modified_at = excluded.last_synced_modified_at,
                last_synced_at = excluded.last_synced_at;
            ",
        )
        .bind(&entry.scope)
        .bind(&entry.source_id)
        .bind(&entry.sink_document_id)
        .bind(&entry.document_name)
        .bind(&entry.source_path)
        .bind(entry.last_synced_modified_at)
        .bind(entry.last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, scope: &str, source_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM ledger WHERE scope = ?1 AND source_id = ?2")
            .bind(scope)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sink document ids referenced by any scope.
    pub async fn referenced_documents(&self) -> Result<HashSet<String>, LedgerError> {
        let rows = sqlx::query("SELECT DISTINCT sink_document_id FROM ledger")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("sink_document_id")?);
        }
        Ok(out)
    }

    /// Entries other than `(scope, source_id)` that point at `document_id`.
    pub async fn other_references(
        &self,
        document_id: &str,
        scope: &str,
        source_id: &str,
    ) -> Result<u64, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS refs
             FROM ledger
             WHERE sink_document_id = ?1 AND NOT (scope = ?2 AND source_id = ?3)",
        )
        .bind(document_id)
        .bind(scope)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        let refs: i64 = row.try_get("refs")?;
        Ok(refs.max(0) as u64)
    }

    /// Points every entry referencing `from` at `to`; returns the number of entries changed.
    pub async fn repoint_document(&self, from: &str, to: &str) -> Result<u64, LedgerError> {
        let result = sqlx::query("UPDATE ledger SET sink_document_id = ?2 WHERE sink_document_id = ?1")
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerEntry, LedgerError> {
    Ok(LedgerEntry {
        scope: row.try_get("scope")?,
        source_id: row.try_get("source_id")?,
        sink_document_id: row.try_get("sink_document_id")?,
        document_name: row.try_get("document_name")?,
        source_path: row.try_get("source_path")?,
        last_synced_modified_at: row.try_get("last_synced_modified_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, LedgerError> {
    let base = dirs::data_dir().ok_or(LedgerError::MissingDataDir)?;
    Ok(base.join("kbsync").join("ledger.db"))
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
