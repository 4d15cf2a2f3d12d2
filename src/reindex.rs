//! Reindex controller: shadow rebuild plus atomic swap.
//!
//! Runs after a config change that invalidates embeddings (model, chunk
//! size, overlap) or on explicit request. The live indices keep serving
//! queries for the whole rebuild; writes are rejected while it runs.
//!
//! Protocol:
//!
//! 1. Take the KB's reindex guard (`conflict` if already held), then
//!    briefly acquire the write lock to drain in-flight writes.
//! 2. Snapshot the document list.
//! 3. Build shadow indices (`vector.idx.shadow`, `lexical.idx.shadow`)
//!    and a shadow chunk table, re-extracting every document from its
//!    blob with the current config. Per-document failures are recorded
//!    and skipped; the reindex itself continues.
//! 4. Publish progress per document and per embedding batch.
//! 5. Swap under the write lock: replace chunks from the shadow table,
//!    bump the generation, close both index pairs, rename the shadow
//!    files over the live ones, reopen.
//! 6. On error anywhere before the swap, delete the shadow state; the
//!    live KB is untouched and the generation unchanged.
//!
//! In-flight queries hold the previous `Arc<IndexPair>` and finish
//! against its in-memory caches; hydration tolerates chunk ids that were
//! retired by the swap. A crash mid-swap is reconciled at the next open
//! (orphaned index rows are dropped and the lexical index rebuilds from
//! chunk text).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::chunker::chunk_segments;
use crate::config;
use crate::engine::{Engine, KbHandle};
use crate::error::{Error, Result};
use crate::extract::extract;
use crate::lexical_index::LexicalIndex;
use crate::models::{Chunk, ReindexProgress, VectorRow};
use crate::pipeline::{embed_chunks, CancelToken};
use crate::search::IndexPair;
use crate::vector_index::{rename_index_file, VectorIndex};

/// In-memory reindex progress, keyed by KB id. The REST facade polls it;
/// a streaming transport could replace polling without touching the
/// controller.
#[derive(Default)]
pub struct ProgressTable(RwLock<HashMap<String, ReindexProgress>>);

impl ProgressTable {
    pub fn get(&self, kb_id: &str) -> Option<ReindexProgress> {
        self.0.read().get(kb_id).cloned()
    }

    fn set(&self, kb_id: &str, progress: ReindexProgress) {
        self.0.write().insert(kb_id.to_string(), progress);
    }

    fn update(&self, kb_id: &str, f: impl FnOnce(&mut ReindexProgress)) {
        if let Some(p) = self.0.write().get_mut(kb_id) {
            f(p);
        }
    }
}

pub async fn run_reindex(engine: &Engine, handle: &Arc<KbHandle>) -> Result<()> {
    if handle
        .reindexing
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(Error::Conflict(format!(
            "reindex already running for {}",
            handle.id
        )));
    }

    let result = rebuild_and_swap(engine, handle).await;
    handle.reindexing.store(false, Ordering::SeqCst);

    match &result {
        Ok(()) => {
            engine.progress.update(&handle.id, |p| {
                p.status = "completed".to_string();
                p.percent = 100.0;
                p.current_file = None;
                p.current_file_progress = 100.0;
            });
            tracing::info!(kb = %handle.id, "reindex completed");
        }
        Err(e) => {
            let msg = e.to_string();
            engine.progress.update(&handle.id, |p| {
                p.status = "error".to_string();
                p.error = Some(msg.clone());
            });
            tracing::error!(kb = %handle.id, error = %msg, "reindex failed");
        }
    }
    result
}

async fn rebuild_and_swap(engine: &Engine, handle: &Arc<KbHandle>) -> Result<()> {
    let kb_id = handle.id.clone();
    let root = engine.root().to_path_buf();

    // Drain writes that started before the guard went up; everything
    // after sees the reindexing flag and is rejected.
    drop(handle.write_lock.lock().await);

    let kb = handle.storage.kb().await?;
    let embedder = engine.embedder_for(&kb.config.embedding_model)?;
    let snapshot = handle.storage.list_documents().await?;

    engine
        .progress
        .set(&kb_id, ReindexProgress::starting(snapshot.len() as u64));

    let vector_live = config::vector_idx_path(&root, &kb_id);
    let lexical_live = config::lexical_idx_path(&root, &kb_id);
    let vector_shadow = vector_live.with_extension("idx.shadow");
    let lexical_shadow = lexical_live.with_extension("idx.shadow");

    // Stale shadows from an interrupted run.
    std::fs::remove_file(&vector_shadow).ok();
    std::fs::remove_file(&lexical_shadow).ok();
    handle.storage.drop_shadow_chunks().await?;

    let shadow = IndexPair {
        vector: VectorIndex::open(&vector_shadow).await?,
        lexical: LexicalIndex::open(&lexical_shadow).await?,
    };

    let build = build_shadow(engine, handle, &kb.config, &embedder, &snapshot, &shadow).await;

    let doc_results = match build {
        Ok(results) => results,
        Err(e) => {
            shadow.vector.close().await;
            shadow.lexical.close().await;
            std::fs::remove_file(&vector_shadow).ok();
            std::fs::remove_file(&lexical_shadow).ok();
            handle.storage.drop_shadow_chunks().await.ok();
            return Err(e);
        }
    };

    // ── Swap ─────────────────────────────────────────────────────────────
    let _guard = handle.write_lock.lock().await;

    handle.storage.swap_shadow_chunks(&doc_results).await?;

    shadow.vector.close().await;
    shadow.lexical.close().await;
    {
        let live = handle.current_indices();
        live.vector.close().await;
        live.lexical.close().await;
    }

    rename_index_file(&vector_shadow, &vector_live)?;
    rename_index_file(&lexical_shadow, &lexical_live)?;

    let reopened = IndexPair {
        vector: VectorIndex::open(&vector_live).await?,
        lexical: LexicalIndex::open(&lexical_live).await?,
    };
    *handle.indices.write() = Arc::new(reopened);

    Ok(())
}

type DocResult = (String, i64, Option<String>);

/// Re-extract, re-chunk, and re-embed every snapshotted document into the
/// shadow pair. Per-document extraction and embedding failures are
/// recorded; storage failures abort.
async fn build_shadow(
    engine: &Engine,
    handle: &Arc<KbHandle>,
    cfg: &crate::models::KbConfig,
    embedder: &Arc<dyn crate::embedding::EmbeddingProvider>,
    snapshot: &[crate::models::Document],
    shadow: &IndexPair,
) -> Result<Vec<DocResult>> {
    let kb_id = &handle.id;
    let total = snapshot.len() as u64;
    let cancel = CancelToken::new();
    let mut results: Vec<DocResult> = Vec::with_capacity(snapshot.len());
    let mut succeeded = 0u64;
    let mut failed = 0u64;

    for (i, doc) in snapshot.iter().enumerate() {
        engine.progress.update(kb_id, |p| {
            p.current_file = Some(doc.filename.clone());
            p.current_file_progress = 0.0;
        });

        match rebuild_document(engine, handle, cfg, embedder, doc, shadow, &cancel).await {
            Ok(Outcome::Rebuilt(count)) => {
                succeeded += 1;
                results.push((doc.id.clone(), count, None));
            }
            Ok(Outcome::Skipped(reason)) => {
                failed += 1;
                tracing::warn!(kb = %kb_id, document = %doc.id, error = %reason, "document skipped during reindex");
                results.push((doc.id.clone(), 0, Some(reason)));
            }
            Err(e) => return Err(e),
        }

        let processed = (i + 1) as u64;
        engine.progress.update(kb_id, |p| {
            p.processed = processed;
            p.succeeded = succeeded;
            p.failed = failed;
            p.percent = if total == 0 {
                100.0
            } else {
                processed as f64 / total as f64 * 100.0
            };
            p.current_file_progress = 100.0;
        });
    }

    Ok(results)
}

enum Outcome {
    Rebuilt(i64),
    Skipped(String),
}

async fn rebuild_document(
    engine: &Engine,
    handle: &Arc<KbHandle>,
    cfg: &crate::models::KbConfig,
    embedder: &Arc<dyn crate::embedding::EmbeddingProvider>,
    doc: &crate::models::Document,
    shadow: &IndexPair,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let bytes = match handle.storage.open_blob(&doc.stored_path).await {
        Ok(b) => b,
        Err(e) => return Ok(Outcome::Skipped(e.to_string())),
    };

    let segments = match extract(doc.format, &bytes, &engine.ocr) {
        Ok(s) => s,
        Err(e) => return Ok(Outcome::Skipped(e.to_string())),
    };

    let drafts = chunk_segments(
        segments,
        cfg.chunk_size,
        cfg.chunk_overlap,
        cfg.overlap_enabled,
        |t| embedder.count_tokens(t),
    );

    if drafts.is_empty() {
        handle.storage.stage_shadow_chunks(&doc.id, &[]).await?;
        return Ok(Outcome::Rebuilt(0));
    }

    let chunks: Vec<Chunk> = drafts
        .iter()
        .enumerate()
        .map(|(seq, d)| Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            seq: seq as i64,
            text: d.text.clone(),
            token_count: d.token_count as i64,
            page: d.page,
            paragraph: d.paragraph,
        })
        .collect();

    let kb_id = handle.id.clone();
    let vectors = match embed_chunks(embedder, &chunks, cancel, |pct| {
        engine.progress.update(&kb_id, |p| {
            p.current_file_progress = pct;
        });
    })
    .await
    {
        Ok(v) => v,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => return Ok(Outcome::Skipped(e.to_string())),
    };

    let vector_rows: Vec<VectorRow> = chunks
        .iter()
        .zip(vectors.into_iter())
        .map(|(chunk, embedding)| VectorRow {
            chunk_id: chunk.id.clone(),
            document_id: doc.id.clone(),
            model: embedder.model_id().to_string(),
            embedding,
        })
        .collect();
    let lexical_rows: Vec<(String, String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), doc.id.clone(), c.text.clone()))
        .collect();

    shadow.vector.add_batch(&vector_rows).await?;
    shadow.lexical.add_batch(&lexical_rows).await?;
    handle.storage.stage_shadow_chunks(&doc.id, &chunks).await?;

    Ok(Outcome::Rebuilt(chunks.len() as i64))
}
