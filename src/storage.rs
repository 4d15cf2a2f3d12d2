//! Per-KB storage: raw blobs plus the `meta.db` metadata store.
//!
//! Blobs are written once under `blobs/<doc-id>.<ext>`. Metadata lives in
//! SQLite and is the single source of truth for chunk text; the indices
//! hold only chunk ids and what they need for scoring.
//!
//! Crash recovery is reconciliation-based and runs at open time via
//! [`KbStorage::repair`]: documents stuck in a non-terminal status are
//! marked failed and their chunks purged, and blobs without a document row
//! are deleted. The index files reconcile themselves against
//! [`KbStorage::chunk_ids`] (dropping rows whose chunk no longer exists),
//! which is why ingestion writes index rows *before* the metadata commit:
//! a crash in between leaves only index orphans, never a committed
//! document with missing vectors.

use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{Chunk, DocStatus, Document, DocumentFormat, KbConfig, KbStats, KnowledgeBase};

pub struct KbStorage {
    pub kb_id: String,
    dir: PathBuf,
    pool: SqlitePool,
}

/// What [`KbStorage::repair`] cleaned up.
#[derive(Debug, Default)]
pub struct RepairReport {
    pub interrupted_documents: u64,
    pub orphaned_blobs: u64,
}

impl KbStorage {
    /// Create a fresh KB directory, schema, and `kb` row.
    pub async fn create(
        root: &Path,
        kb_id: &str,
        name: &str,
        description: Option<&str>,
        cfg: &KbConfig,
    ) -> Result<KbStorage> {
        let dir = config::kb_dir(root, kb_id);
        std::fs::create_dir_all(config::blobs_dir(root, kb_id))?;

        let pool = crate::db::open_meta_pool(&config::meta_path(root, kb_id)).await?;
        migrate::init_kb_schema(&pool).await?;

        sqlx::query(
            "INSERT INTO kb (id, name, description, created_at, config_json, generation) \
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(kb_id)
        .bind(name)
        .bind(description)
        .bind(chrono::Utc::now().timestamp())
        .bind(serde_json::to_string(cfg)?)
        .execute(&pool)
        .await?;

        Ok(KbStorage {
            kb_id: kb_id.to_string(),
            dir,
            pool,
        })
    }

    /// Open an existing KB directory.
    pub async fn open(root: &Path, kb_id: &str) -> Result<KbStorage> {
        let dir = config::kb_dir(root, kb_id);
        if !dir.exists() {
            return Err(Error::NotFound(format!("knowledge base {}", kb_id)));
        }
        let pool = crate::db::open_meta_pool(&config::meta_path(root, kb_id)).await?;
        migrate::init_kb_schema(&pool).await?;
        Ok(KbStorage {
            kb_id: kb_id.to_string(),
            dir,
            pool,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Blobs ────────────────────────────────────────────────────────────

    fn blobs_dir(&self) -> PathBuf {
        self.dir.join("blobs")
    }

    /// Write the raw upload under a name derived from the document id.
    /// Returns the stored path relative to the KB directory.
    pub async fn put_blob(&self, doc_id: &str, ext: &str, bytes: &[u8]) -> Result<String> {
        let rel = format!("blobs/{}.{}", doc_id, ext);
        let path = self.dir.join(&rel);
        tokio::fs::create_dir_all(self.blobs_dir()).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(rel)
    }

    pub async fn open_blob(&self, stored_path: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(stored_path);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::StorageFailed(format!("reading blob {}: {}", stored_path, e)))
    }

    pub async fn delete_blob(&self, stored_path: &str) -> Result<()> {
        let path = self.dir.join(stored_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── KB row ───────────────────────────────────────────────────────────

    pub async fn kb(&self) -> Result<KnowledgeBase> {
        let row = sqlx::query("SELECT id, name, description, created_at, config_json, generation FROM kb LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::IndexCorrupt(format!("kb row missing for {}", self.kb_id)))?;

        let config_json: String = row.get("config_json");
        let config: KbConfig = serde_json::from_str(&config_json)
            .map_err(|e| Error::IndexCorrupt(format!("kb config unreadable: {}", e)))?;

        Ok(KnowledgeBase {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            created_at: row.get("created_at"),
            config,
            generation: row.get("generation"),
        })
    }

    pub async fn rename_kb(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE kb SET name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_description(&self, description: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE kb SET description = ?")
            .bind(description)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn put_config(&self, cfg: &KbConfig) -> Result<()> {
        cfg.validate()?;
        sqlx::query("UPDATE kb SET config_json = ?")
            .bind(serde_json::to_string(cfg)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_generation(&self) -> Result<i64> {
        sqlx::query("UPDATE kb SET generation = generation + 1")
            .execute(&self.pool)
            .await?;
        let gen: i64 = sqlx::query_scalar("SELECT generation FROM kb LIMIT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(gen)
    }

    // ── Documents ────────────────────────────────────────────────────────

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (id, filename, stored_path, format, size_bytes, ingested_at, chunk_count, status, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.stored_path)
        .bind(doc.format.as_str())
        .bind(doc.size_bytes)
        .bind(doc.ingested_at)
        .bind(doc.chunk_count)
        .bind(doc.status.as_str())
        .bind(&doc.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        doc_id: &str,
        status: DocStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?, error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn document(&self, doc_id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", doc_id)))?;
        Ok(Self::row_to_document(&self.kb_id, &row))
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY ingested_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| Self::row_to_document(&self.kb_id, r))
            .collect())
    }

    fn row_to_document(kb_id: &str, row: &sqlx::sqlite::SqliteRow) -> Document {
        let format: String = row.get("format");
        let status: String = row.get("status");
        Document {
            id: row.get("id"),
            kb_id: kb_id.to_string(),
            filename: row.get("filename"),
            stored_path: row.get("stored_path"),
            format: DocumentFormat::parse(&format),
            size_bytes: row.get("size_bytes"),
            ingested_at: row.get("ingested_at"),
            chunk_count: row.get("chunk_count"),
            status: DocStatus::parse(&status),
            error: row.get("error"),
        }
    }

    // ── Chunks ───────────────────────────────────────────────────────────

    /// Install a document's chunks and flip it to `ready` in one
    /// transaction. Any previous chunks for the document are replaced;
    /// chunk mutation is always delete-then-reinsert.
    pub async fn commit_document(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, seq, text, token_count, page, paragraph) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.seq)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.page)
            .bind(chunk.paragraph)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE documents SET chunk_count = ?, status = 'ready', error = NULL WHERE id = ?")
            .bind(chunks.len() as i64)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove a document and its chunks. The caller clears index rows and
    /// the blob; a crash in between is reconciled at the next open.
    pub async fn delete_document_rows(&self, doc_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop a document's chunks without touching the document row. Used
    /// when a failed ingestion must leave no partial content behind.
    pub async fn purge_chunks(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn chunks_for_document(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY seq ASC")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
        Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            seq: row.get("seq"),
            text: row.get("text"),
            token_count: row.get("token_count"),
            page: row.get("page"),
            paragraph: row.get("paragraph"),
        }
    }

    /// Hydrate chunk ids into `(chunk, document)` pairs for search
    /// results. Unknown ids are silently skipped: a query that raced a
    /// reindex swap may hold ids from the retired snapshot.
    pub async fn hydrate_chunks(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashMap<String, (Chunk, Document)>> {
        let mut out = HashMap::new();
        for chunk_id in chunk_ids {
            let row = sqlx::query(
                "SELECT c.id, c.document_id, c.seq, c.text, c.token_count, c.page, c.paragraph, \
                        d.id AS d_id, d.filename, d.stored_path, d.format, d.size_bytes, \
                        d.ingested_at, d.chunk_count, d.status, d.error \
                 FROM chunks c JOIN documents d ON d.id = c.document_id \
                 WHERE c.id = ?",
            )
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                let chunk = Self::row_to_chunk(&row);
                let format: String = row.get("format");
                let status: String = row.get("status");
                let doc = Document {
                    id: row.get("d_id"),
                    kb_id: self.kb_id.clone(),
                    filename: row.get("filename"),
                    stored_path: row.get("stored_path"),
                    format: DocumentFormat::parse(&format),
                    size_bytes: row.get("size_bytes"),
                    ingested_at: row.get("ingested_at"),
                    chunk_count: row.get("chunk_count"),
                    status: DocStatus::parse(&status),
                    error: row.get("error"),
                };
                out.insert(chunk_id.clone(), (chunk, doc));
            }
        }
        Ok(out)
    }

    /// All live chunk ids; the manifest the index files reconcile against.
    pub async fn chunk_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Every chunk's `(id, document_id, text)`, for rebuilding a missing
    /// or corrupt lexical index without re-extraction.
    pub async fn all_chunk_texts(&self) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query("SELECT id, document_id, text FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("id"), r.get("document_id"), r.get("text")))
            .collect())
    }

    // ── Shadow chunks (reindex) ──────────────────────────────────────────

    /// Stage a document's re-chunked rows during a reindex. The shadow
    /// table keeps the live `chunks` untouched until the swap.
    pub async fn stage_shadow_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.ensure_shadow_table().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_shadow WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks_shadow (id, document_id, seq, text, token_count, page, paragraph) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.seq)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.page)
            .bind(chunk.paragraph)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ensure_shadow_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks_shadow (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                page INTEGER,
                paragraph INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically replace the live chunks with the staged shadow set,
    /// update per-document chunk counts and statuses, and bump the
    /// generation counter. Returns the new generation.
    pub async fn swap_shadow_chunks(
        &self,
        doc_results: &[(String, i64, Option<String>)],
    ) -> Result<i64> {
        self.ensure_shadow_table().await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO chunks (id, document_id, seq, text, token_count, page, paragraph) \
             SELECT id, document_id, seq, text, token_count, page, paragraph FROM chunks_shadow",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DROP TABLE chunks_shadow")
            .execute(&mut *tx)
            .await?;

        for (doc_id, chunk_count, error) in doc_results {
            match error {
                None => {
                    sqlx::query(
                        "UPDATE documents SET chunk_count = ?, status = 'ready', error = NULL WHERE id = ?",
                    )
                    .bind(chunk_count)
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await?;
                }
                Some(reason) => {
                    sqlx::query(
                        "UPDATE documents SET chunk_count = 0, status = 'failed', error = ? WHERE id = ?",
                    )
                    .bind(reason)
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        sqlx::query("UPDATE kb SET generation = generation + 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let gen: i64 = sqlx::query_scalar("SELECT generation FROM kb LIMIT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(gen)
    }

    /// Discard any staged shadow chunks after a failed reindex.
    pub async fn drop_shadow_chunks(&self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS chunks_shadow")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Stats & repair ───────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<KbStats> {
        let kb = self.kb().await?;
        let docs = self.list_documents().await?;

        let mut file_types: HashMap<String, i64> = HashMap::new();
        let mut total_size = 0i64;
        let mut total_chunks = 0i64;
        for doc in &docs {
            *file_types.entry(doc.format.as_str().to_string()).or_insert(0) += 1;
            total_size += doc.size_bytes;
            if doc.status == DocStatus::Ready {
                total_chunks += doc.chunk_count;
            }
        }

        Ok(KbStats {
            kb_id: kb.id,
            name: kb.name,
            file_count: docs.len() as i64,
            total_size,
            total_chunks,
            file_types,
            generation: kb.generation,
        })
    }

    /// Reconcile after a crash: documents stuck mid-ingestion are failed
    /// and purged, blobs without a document row are deleted, and a stale
    /// shadow table from an interrupted reindex is dropped.
    pub async fn repair(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        let rows = sqlx::query("SELECT id, status FROM documents")
            .fetch_all(&self.pool)
            .await?;
        let mut live_paths: HashSet<String> = HashSet::new();

        for row in &rows {
            let id: String = row.get("id");
            let status: String = row.get("status");
            if !DocStatus::parse(&status).is_terminal() {
                self.purge_chunks(&id).await?;
                self.set_status(&id, DocStatus::Failed, Some("interrupted by shutdown"))
                    .await?;
                report.interrupted_documents += 1;
                tracing::warn!(kb = %self.kb_id, document = %id, "repaired interrupted ingestion");
            }
        }

        let paths: Vec<String> = sqlx::query_scalar("SELECT stored_path FROM documents")
            .fetch_all(&self.pool)
            .await?;
        live_paths.extend(paths);

        let blobs = self.blobs_dir();
        if blobs.exists() {
            let mut entries = tokio::fs::read_dir(&blobs).await?;
            while let Some(entry) = entries.next_entry().await? {
                let rel = format!(
                    "blobs/{}",
                    entry.file_name().to_string_lossy()
                );
                if !live_paths.contains(&rel) {
                    tokio::fs::remove_file(entry.path()).await.ok();
                    report.orphaned_blobs += 1;
                    tracing::warn!(kb = %self.kb_id, blob = %rel, "removed orphaned blob");
                }
            }
        }

        self.drop_shadow_chunks().await?;

        Ok(report)
    }
}
