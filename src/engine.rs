//! The engine: dependency-injected coordinator for one data root.
//!
//! Owns the instance lockfile, the per-KB handles (metadata store, index
//! pair, write lock, reindex guard), the shared embedding providers, the
//! reindex progress table, and the tool-server supervisor. Construction
//! follows leaf-first order: storage and indices open per KB, then the
//! supervisor loads its records.
//!
//! # Concurrency
//!
//! Each KB carries an async write lock serializing ingestion, deletion,
//! and the reindex swap. Queries never take it: they clone the current
//! `Arc<IndexPair>` and search the in-memory caches, so a writer can swap
//! indices underneath without disturbing readers. Writes during a reindex
//! are rejected with `conflict` (the simpler of the two behaviors the
//! design allows; see DESIGN.md).
//!
//! A second engine opening the same data root read-write is refused via
//! `<root>/.lock`. Tool-server children open the root read-only: no
//! lockfile, no startup repair, no supervisor actions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{self, AppConfig};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::extract::Ocr;
use crate::lexical_index::LexicalIndex;
use crate::models::{Document, KbConfig, KbStats, KnowledgeBase, QueryResponse, SearchResult};
use crate::pipeline::{self, BatchPosition, CancelToken};
use crate::reindex::ProgressTable;
use crate::search::{self, IndexPair};
use crate::storage::KbStorage;
use crate::supervisor::Supervisor;
use crate::vector_index::VectorIndex;

pub struct Engine {
    root: PathBuf,
    pub config: AppConfig,
    pub supervisor: Supervisor,
    kbs: RwLock<HashMap<String, Arc<KbHandle>>>,
    embedders: RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    pub(crate) progress: ProgressTable,
    pub(crate) ocr: Ocr,
    read_only: bool,
    _lock: Option<LockGuard>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

/// Everything the engine holds open for one knowledge base.
pub struct KbHandle {
    pub id: String,
    pub storage: KbStorage,
    /// Swapped wholesale by the reindex controller; queries clone the Arc.
    pub indices: RwLock<Arc<IndexPair>>,
    /// Serializes ingestion, deletion, and the reindex swap.
    pub write_lock: tokio::sync::Mutex<()>,
    /// At most one in-flight reindex; doubles as the upload gate.
    pub reindexing: AtomicBool,
}

impl KbHandle {
    pub fn current_indices(&self) -> Arc<IndexPair> {
        self.indices.read().clone()
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

fn acquire_lockfile(root: &Path) -> Result<LockGuard> {
    let path = config::lockfile_path(root);
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(mut f) => {
            use std::io::Write;
            write!(f, "{}", std::process::id()).ok();
            Ok(LockGuard { path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // A lockfile whose pid is gone is stale (crash leftovers).
            let stale = std::fs::read_to_string(&path)
                .ok()
                .and_then(|pid| pid.trim().parse::<u32>().ok())
                .map(|pid| !Path::new(&format!("/proc/{}", pid)).exists())
                .unwrap_or(false);
            if stale {
                tracing::warn!(lock = %path.display(), "removing stale instance lock");
                std::fs::remove_file(&path)?;
                return acquire_lockfile(root);
            }
            Err(Error::Conflict(format!(
                "data root {} is owned by another instance",
                root.display()
            )))
        }
        Err(e) => Err(e.into()),
    }
}

impl Engine {
    /// Open a data root read-write: acquire the instance lock, repair
    /// each KB, reconcile indices, and load tool-server records.
    pub async fn open(root: &Path) -> Result<Engine> {
        Self::open_inner(root, false).await
    }

    /// Open without the instance lock, startup repair, or supervisor
    /// side effects. Used by tool-server child processes.
    pub async fn open_read_only(root: &Path) -> Result<Engine> {
        Self::open_inner(root, true).await
    }

    async fn open_inner(root: &Path, read_only: bool) -> Result<Engine> {
        let config = AppConfig::load(root)?;
        let lock = if read_only {
            None
        } else {
            config::init_root(root).map_err(|e| Error::StorageFailed(e.to_string()))?;
            Some(acquire_lockfile(root)?)
        };

        let engine = Engine {
            root: root.to_path_buf(),
            supervisor: Supervisor::load(root, &config, read_only)?,
            config,
            kbs: RwLock::new(HashMap::new()),
            embedders: RwLock::new(HashMap::new()),
            progress: ProgressTable::default(),
            ocr: Ocr::detect(),
            read_only,
            _lock: lock,
        };

        let kbs_dir = config::kbs_dir(root);
        if kbs_dir.exists() {
            let mut entries = tokio::fs::read_dir(&kbs_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.path().is_dir() {
                    continue;
                }
                let kb_id = entry.file_name().to_string_lossy().to_string();
                if !config::meta_path(root, &kb_id).exists() {
                    continue;
                }
                match engine.open_handle(&kb_id).await {
                    Ok(handle) => {
                        engine.kbs.write().insert(kb_id, Arc::new(handle));
                    }
                    Err(e) => {
                        tracing::error!(kb = %kb_id, error = %e, "failed to open knowledge base, skipping");
                    }
                }
            }
        }

        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn open_handle(&self, kb_id: &str) -> Result<KbHandle> {
        let storage = KbStorage::open(&self.root, kb_id).await?;
        if !self.read_only {
            storage.repair().await?;
        }

        let vector = VectorIndex::open(&config::vector_idx_path(&self.root, kb_id)).await?;
        let lexical = LexicalIndex::open(&config::lexical_idx_path(&self.root, kb_id)).await?;

        if !self.read_only {
            let live = storage.chunk_ids().await?;
            let dropped_v = vector.retain_chunks(&live).await?;
            let dropped_l = lexical.retain_chunks(&live).await?;
            if dropped_v + dropped_l > 0 {
                tracing::warn!(
                    kb = %kb_id,
                    vectors = dropped_v,
                    postings = dropped_l,
                    "dropped orphaned index rows"
                );
            }

            // The metadata store is the manifest: a missing or wiped
            // lexical index rebuilds from chunk text. Vectors cannot be
            // rebuilt without re-embedding; a reindex restores them.
            if lexical.is_empty() && !live.is_empty() {
                let rows = storage.all_chunk_texts().await?;
                lexical.add_batch(&rows).await?;
                tracing::warn!(kb = %kb_id, chunks = rows.len(), "rebuilt lexical index from chunk text");
            }
            if vector.is_empty() && !live.is_empty() {
                tracing::warn!(kb = %kb_id, "vector index is empty but chunks exist; reindex to restore embeddings");
            }
        }

        Ok(KbHandle {
            id: kb_id.to_string(),
            storage,
            indices: RwLock::new(Arc::new(IndexPair { vector, lexical })),
            write_lock: tokio::sync::Mutex::new(()),
            reindexing: AtomicBool::new(false),
        })
    }

    pub(crate) fn handle(&self, kb_id: &str) -> Result<Arc<KbHandle>> {
        self.kbs
            .read()
            .get(kb_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("knowledge base {}", kb_id)))
    }

    pub(crate) fn insert_handle(&self, kb_id: &str, handle: KbHandle) {
        self.kbs.write().insert(kb_id.to_string(), Arc::new(handle));
    }

    pub(crate) fn remove_handle(&self, kb_id: &str) -> Option<Arc<KbHandle>> {
        self.kbs.write().remove(kb_id)
    }

    pub fn kb_ids(&self) -> Vec<String> {
        self.kbs.read().keys().cloned().collect()
    }

    pub(crate) fn handles(&self) -> Vec<Arc<KbHandle>> {
        self.kbs.read().values().cloned().collect()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Shared, cached provider for a model id.
    pub fn embedder_for(&self, model: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        if let Some(p) = self.embedders.read().get(model) {
            return Ok(p.clone());
        }
        let provider = create_provider(model)?;
        self.embedders
            .write()
            .insert(model.to_string(), provider.clone());
        Ok(provider)
    }

    fn reject_if_reindexing(handle: &KbHandle) -> Result<()> {
        if handle.reindexing.load(Ordering::SeqCst) {
            return Err(Error::Conflict(
                "reindex in progress; writes are rejected until it completes".into(),
            ));
        }
        Ok(())
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Ingest an uploaded file. Returns after commit and index insertion,
    /// so a subsequent query observes the new content (read-your-writes).
    pub async fn upload_document(
        &self,
        kb_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Document> {
        let handle = self.handle(kb_id)?;
        let _guard = handle.write_lock.lock().await;
        Self::reject_if_reindexing(&handle)?;

        let kb = handle.storage.kb().await?;
        let embedder = self.embedder_for(&kb.config.embedding_model)?;
        let indices = handle.current_indices();

        pipeline::ingest_document(
            &handle.storage,
            &indices,
            &embedder,
            &kb.config,
            &self.ocr,
            filename,
            bytes,
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
    }

    pub async fn list_documents(&self, kb_id: &str) -> Result<Vec<Document>> {
        let handle = self.handle(kb_id)?;
        handle.storage.list_documents().await
    }

    pub async fn get_document(&self, kb_id: &str, doc_id: &str) -> Result<Document> {
        let handle = self.handle(kb_id)?;
        handle.storage.document(doc_id).await
    }

    pub async fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
        let handle = self.handle(kb_id)?;
        let _guard = handle.write_lock.lock().await;
        Self::reject_if_reindexing(&handle)?;
        let indices = handle.current_indices();
        pipeline::delete_document(&handle.storage, &indices, doc_id).await
    }

    /// Re-extract, re-chunk, and re-embed one document from its blob.
    pub async fn reprocess_document(&self, kb_id: &str, doc_id: &str) -> Result<Document> {
        let handle = self.handle(kb_id)?;
        let _guard = handle.write_lock.lock().await;
        Self::reject_if_reindexing(&handle)?;

        let kb = handle.storage.kb().await?;
        let embedder = self.embedder_for(&kb.config.embedding_model)?;
        let indices = handle.current_indices();
        pipeline::reprocess_document(
            &handle.storage,
            &indices,
            &embedder,
            &kb.config,
            &self.ocr,
            doc_id,
            &CancelToken::new(),
        )
        .await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn query(&self, kb_id: &str, query: &str, limit: usize) -> Result<QueryResponse> {
        let started = Instant::now();
        let handle = self.handle(kb_id)?;
        let kb = handle.storage.kb().await?;
        let embedder = self.embedder_for(&kb.config.embedding_model)?;
        let indices = handle.current_indices();

        let results = search::run_query(
            &handle.storage,
            &indices,
            embedder.as_ref(),
            &kb.config,
            query,
            limit,
        )
        .await
        .map_err(|e| match e {
            Error::InvalidInput(_) | Error::NotFound(_) => e,
            other => {
                let correlation = uuid::Uuid::new_v4();
                tracing::error!(kb = %kb_id, %correlation, error = %other, "query failed");
                Error::Internal(format!("query failed (correlation {})", correlation))
            }
        })?;

        Ok(QueryResponse {
            total: results.len(),
            results,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        })
    }

    pub async fn find_similar(
        &self,
        kb_id: &str,
        doc_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let handle = self.handle(kb_id)?;
        let kb = handle.storage.kb().await?;
        let embedder = self.embedder_for(&kb.config.embedding_model)?;
        let indices = handle.current_indices();
        search::find_similar(&handle.storage, &indices, embedder.as_ref(), doc_id, limit).await
    }

    // ── Reindex ──────────────────────────────────────────────────────────

    /// Rebuild the KB into shadow indices and swap atomically. Refuses
    /// with `conflict` if a reindex is already in flight.
    pub async fn reindex(&self, kb_id: &str) -> Result<()> {
        let handle = self.handle(kb_id)?;
        crate::reindex::run_reindex(self, &handle).await
    }

    pub fn reindex_progress(&self, kb_id: &str) -> Option<crate::models::ReindexProgress> {
        self.progress.get(kb_id)
    }

    // ── KB config plumbing used by registry and reindex ──────────────────

    pub async fn get_kb(&self, kb_id: &str) -> Result<KnowledgeBase> {
        let handle = self.handle(kb_id)?;
        handle.storage.kb().await
    }

    pub async fn get_config(&self, kb_id: &str) -> Result<KbConfig> {
        Ok(self.get_kb(kb_id).await?.config)
    }

    pub async fn stats(&self, kb_id: &str) -> Result<KbStats> {
        let handle = self.handle(kb_id)?;
        handle.storage.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reindex_guard_rejects_concurrent_reindex_and_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = Engine::open(tmp.path()).await.unwrap();
        let kb = engine.create_kb("kb1", None).await.unwrap();
        engine
            .upload_document(&kb.id, "a.txt", b"some indexed text")
            .await
            .unwrap();

        // Simulate an in-flight reindex.
        let handle = engine.handle(&kb.id).unwrap();
        handle.reindexing.store(true, Ordering::SeqCst);

        let err = engine.reindex(&kb.id).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let err = engine
            .upload_document(&kb.id, "b.txt", b"rejected during reindex")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let err = engine.delete_kb(&kb.id).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // Queries are unaffected.
        let response = engine.query(&kb.id, "indexed", 5).await.unwrap();
        assert_eq!(response.total, 1);

        handle.reindexing.store(false, Ordering::SeqCst);
        engine
            .upload_document(&kb.id, "b.txt", b"accepted after reindex")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn generation_unchanged_when_guard_refuses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = Engine::open(tmp.path()).await.unwrap();
        let kb = engine.create_kb("kb1", None).await.unwrap();

        let handle = engine.handle(&kb.id).unwrap();
        handle.reindexing.store(true, Ordering::SeqCst);
        engine.reindex(&kb.id).await.unwrap_err();
        handle.reindexing.store(false, Ordering::SeqCst);

        assert_eq!(engine.get_kb(&kb.id).await.unwrap().generation, 0);

        engine.reindex(&kb.id).await.unwrap();
        assert_eq!(engine.get_kb(&kb.id).await.unwrap().generation, 1);
    }
}
