//! Per-KB vector index.
//!
//! Maps chunk id → unit vector for the KB's current embedding model.
//! Rows persist in a single SQLite file (`vector.idx`) as little-endian
//! f32 BLOBs; a full in-memory copy behind a `RwLock` serves searches, so
//! the query path never touches the pool and stays valid even while the
//! file is being swapped out by a reindex. Writers mutate the file first
//! and the cache second, under the KB write lock.
//!
//! Search is a brute-force dot-product scan (well under the latency
//! target up to ~100k chunks) with ties broken by chunk id so ordering
//! is stable. Rows whose model tag differs from the querying model are
//! skipped, which makes stale rows harmless after a model change until
//! the reindex completes.

use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::embedding::{blob_to_vec, dot, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::VectorRow;

pub struct VectorIndex {
    path: PathBuf,
    pool: SqlitePool,
    rows: RwLock<Vec<VectorRow>>,
}

impl VectorIndex {
    /// Open (or create) the index file and load the scan cache.
    pub async fn open(path: &Path) -> Result<VectorIndex> {
        let pool = crate::db::open_index_pool(path).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vectors (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                model TEXT NOT NULL,
                embedding BLOB NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vectors_document_id ON vectors(document_id)",
        )
        .execute(&pool)
        .await?;

        let db_rows = sqlx::query("SELECT chunk_id, document_id, model, embedding FROM vectors")
            .fetch_all(&pool)
            .await
            .map_err(|e| Error::IndexCorrupt(format!("{}: {}", path.display(), e)))?;

        let mut rows = Vec::with_capacity(db_rows.len());
        for row in &db_rows {
            let blob: Vec<u8> = row.get("embedding");
            rows.push(VectorRow {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                model: row.get("model"),
                embedding: blob_to_vec(&blob),
            });
        }

        Ok(VectorIndex {
            path: path.to_path_buf(),
            pool,
            rows: RwLock::new(rows),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Count of rows carrying the given model tag.
    pub fn count_for_model(&self, model: &str) -> usize {
        self.rows.read().iter().filter(|r| r.model == model).count()
    }

    pub async fn add_batch(&self, batch: &[VectorRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in batch {
            sqlx::query(
                "INSERT OR REPLACE INTO vectors (chunk_id, document_id, model, embedding) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&row.chunk_id)
            .bind(&row.document_id)
            .bind(&row.model)
            .bind(vec_to_blob(&row.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut rows = self.rows.write();
        let new_ids: HashSet<&str> = batch.iter().map(|r| r.chunk_id.as_str()).collect();
        rows.retain(|r| !new_ids.contains(r.chunk_id.as_str()));
        rows.extend(batch.iter().cloned());
        Ok(())
    }

    pub async fn delete_by_document(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        self.rows.write().retain(|r| r.document_id != doc_id);
        Ok(())
    }

    /// Top-k by dot product (cosine over unit vectors). `exclude_doc`
    /// drops a document's own chunks for find-similar queries.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        model: &str,
        exclude_doc: Option<&str>,
    ) -> Vec<(String, f32)> {
        let rows = self.rows.read();
        let mut scored: Vec<(&str, f32)> = rows
            .iter()
            .filter(|r| r.model == model)
            .filter(|r| exclude_doc != Some(r.document_id.as_str()))
            .map(|r| (r.chunk_id.as_str(), dot(query, &r.embedding)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect()
    }

    /// All vectors belonging to a document, for find-similar centroids.
    pub fn vectors_for_document(&self, doc_id: &str) -> Vec<Vec<f32>> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.document_id == doc_id)
            .map(|r| r.embedding.clone())
            .collect()
    }

    /// Drop rows whose chunk no longer exists in `meta.db`. Returns the
    /// number removed. Part of startup reconciliation.
    pub async fn retain_chunks(&self, live: &HashSet<String>) -> Result<u64> {
        let stale: Vec<String> = {
            let rows = self.rows.read();
            rows.iter()
                .filter(|r| !live.contains(&r.chunk_id))
                .map(|r| r.chunk_id.clone())
                .collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for id in &stale {
            sqlx::query("DELETE FROM vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.rows.write().retain(|r| live.contains(&r.chunk_id));
        Ok(stale.len() as u64)
    }

    /// Close the pool so the underlying file can be renamed or deleted.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Atomically move an index file into place (the reindex shadow swap).
/// Both pools must be closed first.
pub fn rename_index_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)
        .map_err(|e| Error::StorageFailed(format!("index swap {}: {}", to.display(), e)))
}
