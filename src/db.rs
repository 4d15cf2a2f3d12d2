//! SQLite pool helpers.
//!
//! `meta.db` runs in WAL mode for concurrent readers under a writer. Index
//! files use rollback journals instead: they must be safely renameable for
//! the shadow-swap during reindex, which WAL sidecar files would
//! complicate.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::error::Result;

pub async fn open_meta_pool(path: &Path) -> Result<SqlitePool> {
    open(path, SqliteJournalMode::Wal).await
}

pub async fn open_index_pool(path: &Path) -> Result<SqlitePool> {
    open(path, SqliteJournalMode::Delete).await
}

async fn open(path: &Path, journal: SqliteJournalMode) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(journal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
