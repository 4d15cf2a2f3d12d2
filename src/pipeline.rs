//! Ingestion pipeline: one document from raw bytes to indexed chunks.
//!
//! ```text
//! blob → pending → extracting → chunking → embedding → commit → ready
//! ```
//!
//! Failure isolation: anything that goes wrong with one document records
//! `failed` plus a reason on that document and leaves no chunks, vectors,
//! or postings behind; the caller moves on to the next document. Only
//! infrastructure errors (the metadata store itself failing) propagate.
//!
//! Write ordering matters for crash safety: index rows are written
//! *before* the metadata commit flips the document to `ready`. A crash in
//! between strands index orphans, which startup reconciliation drops; the
//! reverse order could strand a `ready` document with missing vectors,
//! which nothing would repair.
//!
//! Documents within a KB are processed serially under the KB write lock;
//! separate KBs ingest in parallel. Cancellation is checked between
//! phases and embedding batches, never mid-commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunker::chunk_segments;
use crate::embedding::{EmbeddingProvider, BATCH_SIZE, EMBED_TIMEOUT};
use crate::error::{Error, Result};
use crate::extract::{detect_format, extract, Ocr};
use crate::models::{Chunk, DocStatus, Document, DocumentFormat, KbConfig, VectorRow};
use crate::search::IndexPair;
use crate::storage::KbStorage;

/// Cooperative cancellation token threaded through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Pipeline phase reported with progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    Storing,
    Extracting,
    Embedding,
    Committing,
}

impl IngestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestPhase::Storing => "storing",
            IngestPhase::Extracting => "extracting",
            IngestPhase::Embedding => "embedding",
            IngestPhase::Committing => "committing",
        }
    }
}

/// One progress event per phase transition plus one per embedding batch.
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub current: u64,
    pub total: u64,
    pub phase: IngestPhase,
    /// Within-phase completion in `[0, 100]`, when known.
    pub percent: Option<f64>,
}

pub type ProgressFn<'a> = &'a (dyn Fn(IngestEvent) + Send + Sync);

/// Position of this document in a larger batch, for progress reporting.
#[derive(Debug, Clone, Copy)]
pub struct BatchPosition {
    pub current: u64,
    pub total: u64,
}

impl Default for BatchPosition {
    fn default() -> Self {
        Self {
            current: 1,
            total: 1,
        }
    }
}

/// Ingest one uploaded file. Returns the final document row; a document
/// that failed extraction or embedding comes back with status `failed`
/// rather than as an `Err`.
#[allow(clippy::too_many_arguments)]
pub async fn ingest_document(
    storage: &KbStorage,
    indices: &IndexPair,
    embedder: &Arc<dyn EmbeddingProvider>,
    cfg: &KbConfig,
    ocr: &Ocr,
    filename: &str,
    bytes: &[u8],
    cancel: &CancelToken,
    position: BatchPosition,
    progress: Option<ProgressFn<'_>>,
) -> Result<Document> {
    cancel.check()?;
    let report = |phase: IngestPhase, percent: Option<f64>| {
        if let Some(f) = progress {
            f(IngestEvent {
                current: position.current,
                total: position.total,
                phase,
                percent,
            });
        }
    };

    report(IngestPhase::Storing, None);
    let doc_id = uuid::Uuid::new_v4().to_string();
    let format = detect_format(filename, bytes);
    let ext = sanitize_ext(filename);
    let stored_path = storage.put_blob(&doc_id, &ext, bytes).await?;

    let doc = Document {
        id: doc_id.clone(),
        kb_id: storage.kb_id.clone(),
        filename: filename.to_string(),
        stored_path,
        format,
        size_bytes: bytes.len() as i64,
        ingested_at: chrono::Utc::now().timestamp(),
        chunk_count: 0,
        status: DocStatus::Pending,
        error: None,
    };
    storage.insert_document(&doc).await?;

    match process_content(
        storage, indices, embedder, cfg, ocr, &doc_id, format, bytes, cancel, position, progress,
    )
    .await
    {
        Ok(chunk_count) => {
            report(IngestPhase::Committing, Some(100.0));
            let mut done = doc;
            done.status = DocStatus::Ready;
            done.chunk_count = chunk_count;
            tracing::info!(
                kb = %storage.kb_id,
                document = %doc_id,
                filename,
                chunks = chunk_count,
                "document ingested"
            );
            Ok(done)
        }
        Err(Error::Cancelled) => {
            // Cancellation between documents: scrub like a failure but
            // propagate so the caller stops the batch.
            scrub_document(storage, indices, &doc_id).await?;
            storage
                .set_status(&doc_id, DocStatus::Failed, Some("cancelled"))
                .await?;
            Err(Error::Cancelled)
        }
        Err(e) => {
            scrub_document(storage, indices, &doc_id).await?;
            let reason = e.to_string();
            storage
                .set_status(&doc_id, DocStatus::Failed, Some(&reason))
                .await?;
            tracing::warn!(
                kb = %storage.kb_id,
                document = %doc_id,
                filename,
                error = %reason,
                "document ingestion failed"
            );
            let mut failed = doc;
            failed.status = DocStatus::Failed;
            failed.error = Some(reason);
            Ok(failed)
        }
    }
}

/// Extract → chunk → embed → index → commit. Returns the chunk count.
#[allow(clippy::too_many_arguments)]
async fn process_content(
    storage: &KbStorage,
    indices: &IndexPair,
    embedder: &Arc<dyn EmbeddingProvider>,
    cfg: &KbConfig,
    ocr: &Ocr,
    doc_id: &str,
    format: DocumentFormat,
    bytes: &[u8],
    cancel: &CancelToken,
    position: BatchPosition,
    progress: Option<ProgressFn<'_>>,
) -> Result<i64> {
    let report = |phase: IngestPhase, percent: Option<f64>| {
        if let Some(f) = progress {
            f(IngestEvent {
                current: position.current,
                total: position.total,
                phase,
                percent,
            });
        }
    };

    cancel.check()?;
    report(IngestPhase::Extracting, None);
    storage
        .set_status(doc_id, DocStatus::Extracting, None)
        .await?;

    let segments = extract(format, bytes, ocr)?;
    let drafts = chunk_segments(
        segments,
        cfg.chunk_size,
        cfg.chunk_overlap,
        cfg.overlap_enabled,
        |t| embedder.count_tokens(t),
    );

    // A document that extracts to no text is ready with zero chunks.
    if drafts.is_empty() {
        storage.commit_document(doc_id, &[]).await?;
        return Ok(0);
    }

    cancel.check()?;
    report(IngestPhase::Embedding, Some(0.0));
    storage
        .set_status(doc_id, DocStatus::Embedding, None)
        .await?;

    let chunks: Vec<Chunk> = drafts
        .iter()
        .enumerate()
        .map(|(seq, d)| Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc_id.to_string(),
            seq: seq as i64,
            text: d.text.clone(),
            token_count: d.token_count as i64,
            page: d.page,
            paragraph: d.paragraph,
        })
        .collect();

    let vectors = embed_chunks(embedder, &chunks, cancel, |pct| {
        report(IngestPhase::Embedding, Some(pct));
    })
    .await?;

    cancel.check()?;
    report(IngestPhase::Committing, None);

    let vector_rows: Vec<VectorRow> = chunks
        .iter()
        .zip(vectors.into_iter())
        .map(|(chunk, embedding)| VectorRow {
            chunk_id: chunk.id.clone(),
            document_id: doc_id.to_string(),
            model: embedder.model_id().to_string(),
            embedding,
        })
        .collect();
    let lexical_rows: Vec<(String, String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), doc_id.to_string(), c.text.clone()))
        .collect();

    // Indices first, metadata commit last (see module docs).
    indices.vector.add_batch(&vector_rows).await?;
    indices.lexical.add_batch(&lexical_rows).await?;
    storage.commit_document(doc_id, &chunks).await?;

    Ok(chunks.len() as i64)
}

/// Embed chunk texts in order, batched, with a per-batch timeout.
pub async fn embed_chunks(
    embedder: &Arc<dyn EmbeddingProvider>,
    chunks: &[Chunk],
    cancel: &CancelToken,
    mut on_batch: impl FnMut(f64),
) -> Result<Vec<Vec<f32>>> {
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    let batches: Vec<&[Chunk]> = chunks.chunks(BATCH_SIZE).collect();
    let total = batches.len();

    for (i, batch) in batches.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embedded = tokio::time::timeout(EMBED_TIMEOUT, embedder.embed(&texts))
            .await
            .map_err(|_| Error::Timeout("embedding batch exceeded 60s".into()))??;
        if embedded.len() != texts.len() {
            return Err(Error::EmbeddingFailed(format!(
                "provider returned {} vectors for {} texts",
                embedded.len(),
                texts.len()
            )));
        }
        vectors.extend(embedded);
        on_batch(((i + 1) as f64 / total as f64) * 100.0);
    }
    Ok(vectors)
}

/// Remove every trace of a document's derived content (chunks, vectors,
/// postings), leaving the document row and blob in place.
pub async fn scrub_document(
    storage: &KbStorage,
    indices: &IndexPair,
    doc_id: &str,
) -> Result<()> {
    indices.vector.delete_by_document(doc_id).await?;
    indices.lexical.delete_by_document(doc_id).await?;
    storage.purge_chunks(doc_id).await?;
    Ok(())
}

/// Delete a document entirely: rows first (source of truth), then index
/// entries, then the blob. A crash between steps leaves only orphans that
/// startup reconciliation clears.
pub async fn delete_document(
    storage: &KbStorage,
    indices: &IndexPair,
    doc_id: &str,
) -> Result<()> {
    let doc = storage.document(doc_id).await?;
    storage.delete_document_rows(doc_id).await?;
    indices.vector.delete_by_document(doc_id).await?;
    indices.lexical.delete_by_document(doc_id).await?;
    storage.delete_blob(&doc.stored_path).await?;
    tracing::info!(kb = %storage.kb_id, document = %doc_id, "document deleted");
    Ok(())
}

/// Re-run extraction, chunking, and embedding for an existing document
/// from its stored blob, using the KB's current config. Chunk ids are
/// regenerated; content is equivalent for an unchanged config.
pub async fn reprocess_document(
    storage: &KbStorage,
    indices: &IndexPair,
    embedder: &Arc<dyn EmbeddingProvider>,
    cfg: &KbConfig,
    ocr: &Ocr,
    doc_id: &str,
    cancel: &CancelToken,
) -> Result<Document> {
    let doc = storage.document(doc_id).await?;
    let bytes = storage.open_blob(&doc.stored_path).await?;

    scrub_document(storage, indices, doc_id).await?;

    match process_content(
        storage,
        indices,
        embedder,
        cfg,
        ocr,
        doc_id,
        doc.format,
        &bytes,
        cancel,
        BatchPosition::default(),
        None,
    )
    .await
    {
        Ok(chunk_count) => {
            let mut done = doc;
            done.status = DocStatus::Ready;
            done.chunk_count = chunk_count;
            done.error = None;
            Ok(done)
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            scrub_document(storage, indices, doc_id).await?;
            let reason = e.to_string();
            storage
                .set_status(doc_id, DocStatus::Failed, Some(&reason))
                .await?;
            let mut failed = doc;
            failed.status = DocStatus::Failed;
            failed.chunk_count = 0;
            failed.error = Some(reason);
            Ok(failed)
        }
    }
}

/// Derive a storable extension from the upload's filename.
fn sanitize_ext(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or("");
    let clean: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if clean.is_empty() || clean.len() == filename.len() {
        "bin".to_string()
    } else {
        clean.to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical_index::LexicalIndex;
    use crate::models::KbConfig;
    use crate::vector_index::VectorIndex;

    async fn setup() -> (
        tempfile::TempDir,
        KbStorage,
        IndexPair,
        Arc<dyn EmbeddingProvider>,
        KbConfig,
    ) {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = KbConfig::default();
        let storage = KbStorage::create(tmp.path(), "kb1", "test", None, &cfg)
            .await
            .unwrap();
        let indices = IndexPair {
            vector: VectorIndex::open(&tmp.path().join("vector.idx")).await.unwrap(),
            lexical: LexicalIndex::open(&tmp.path().join("lexical.idx")).await.unwrap(),
        };
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(crate::embedding::HashEmbedder::new(64));
        (tmp, storage, indices, embedder, cfg)
    }

    #[tokio::test]
    async fn text_upload_reaches_ready_with_parity() {
        let (_tmp, storage, indices, embedder, cfg) = setup().await;
        let doc = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "hello.txt",
            b"The quick brown fox jumps over the lazy dog.",
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(doc.status, DocStatus::Ready);
        assert_eq!(doc.chunk_count, 1);
        assert_eq!(indices.vector.count_for_model("hash-64"), 1);
        assert_eq!(indices.lexical.len(), 1);

        let chunks = storage.chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
    }

    #[tokio::test]
    async fn whitespace_only_upload_is_ready_with_zero_chunks() {
        let (_tmp, storage, indices, embedder, cfg) = setup().await;
        let doc = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "blank.txt",
            b"                                                  ",
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(doc.status, DocStatus::Ready);
        assert_eq!(doc.chunk_count, 0);
        assert!(indices.vector.is_empty());
        assert!(indices.lexical.is_empty());
    }

    #[tokio::test]
    async fn corrupt_pdf_fails_document_leaving_nothing() {
        let (_tmp, storage, indices, embedder, cfg) = setup().await;
        let doc = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "broken.pdf",
            b"%PDF-garbage that is not a pdf",
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(doc.status, DocStatus::Failed);
        assert!(doc.error.is_some());
        assert!(indices.vector.is_empty());
        assert!(indices.lexical.is_empty());
        assert!(storage.chunks_for_document(&doc.id).await.unwrap().is_empty());

        // The metadata row survives with the failure reason.
        let stored = storage.document(&doc.id).await.unwrap();
        assert_eq!(stored.status, DocStatus::Failed);
    }

    #[tokio::test]
    async fn delete_document_removes_everything() {
        let (_tmp, storage, indices, embedder, cfg) = setup().await;
        let doc = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "gone.txt",
            b"ephemeral content about volcanoes",
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap();

        delete_document(&storage, &indices, &doc.id).await.unwrap();

        assert!(storage.document(&doc.id).await.is_err());
        assert!(indices.vector.is_empty());
        assert!(indices.lexical.is_empty());
        assert!(storage.open_blob(&doc.stored_path).await.is_err());
        assert!(indices.lexical.search("volcanoes", 10, 1.5, 0.75).is_empty());
    }

    #[tokio::test]
    async fn reprocess_is_idempotent_for_unchanged_config() {
        let (_tmp, storage, indices, embedder, cfg) = setup().await;
        let doc = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "stable.txt",
            b"Paragraph one about databases.\n\nParagraph two about indexing.",
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap();

        let before_chunks = storage.chunks_for_document(&doc.id).await.unwrap();
        let before_vectors = indices.vector.len();

        let redone = reprocess_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            &doc.id,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(redone.status, DocStatus::Ready);
        assert_eq!(redone.chunk_count, doc.chunk_count);
        assert_eq!(indices.vector.len(), before_vectors);

        let after_chunks = storage.chunks_for_document(&doc.id).await.unwrap();
        let before_texts: Vec<&str> = before_chunks.iter().map(|c| c.text.as_str()).collect();
        let after_texts: Vec<&str> = after_chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(before_texts, after_texts);
        // Ids regenerate.
        assert_ne!(before_chunks[0].id, after_chunks[0].id);
    }

    #[tokio::test]
    async fn cancelled_ingest_propagates_and_scrubs() {
        let (_tmp, storage, indices, embedder, cfg) = setup().await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "nope.txt",
            b"never stored",
            &cancel,
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn extension_sanitizing() {
        assert_eq!(sanitize_ext("report.PDF"), "pdf");
        assert_eq!(sanitize_ext("noext"), "bin");
        assert_eq!(sanitize_ext("weird.t$x!t"), "txt");
        assert_eq!(sanitize_ext("archive.tar.gz"), "gz");
    }

    #[tokio::test]
    async fn chunk_sequences_are_dense() {
        let (_tmp, storage, indices, embedder, _) = setup().await;
        let mut cfg = KbConfig::default();
        cfg.chunk_size = 5;
        cfg.chunk_overlap = 0;
        cfg.overlap_enabled = false;

        let body = (0..60).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let doc = ingest_document(
            &storage,
            &indices,
            &embedder,
            &cfg,
            &Ocr::default(),
            "dense.txt",
            body.as_bytes(),
            &CancelToken::new(),
            BatchPosition::default(),
            None,
        )
        .await
        .unwrap();

        assert!(doc.chunk_count > 1);
        let chunks = storage.chunks_for_document(&doc.id).await.unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.seq, i as i64);
        }
        assert_eq!(chunks.len() as i64, doc.chunk_count);
    }
}
