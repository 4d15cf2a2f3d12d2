//! Core data types that flow through the engine.
//!
//! ```text
//! upload → Document(pending) → Segment → ChunkDraft → Chunk
//!                                             ↓
//!                                        embed() → vector rows
//!                                             ↓
//!                                        query() → SearchResult
//! ```
//!
//! A [`KnowledgeBase`] owns its documents, both indices, and a
//! [`KbConfig`]. Tool servers are described by [`ToolServerRecord`]s and
//! reference knowledge bases by id only, so neither side holds the other.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A logically isolated collection of documents plus its own indices and
/// configuration. The `id` is stable across renames; `generation` is
/// incremented on every successful reindex and lets clients detect
/// staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Unix epoch seconds.
    pub created_at: i64,
    pub config: KbConfig,
    pub generation: i64,
}

/// Per-KB configuration.
///
/// `embedding_model`, `chunk_size`, `chunk_overlap`, and `overlap_enabled`
/// shape chunk content or embeddings: changing any of them requires a
/// reindex. The retrieval parameters (`hybrid_*`, `bm25_*`) apply to the
/// next query immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KbConfig {
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Chunk size in tokens.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks, in tokens.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub overlap_enabled: bool,
    #[serde(default = "default_true")]
    pub hybrid_search: bool,
    /// Weight of the vector score in hybrid fusion, in `[0, 1]`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
}

fn default_embedding_model() -> String {
    "hash-256".to_string()
}
fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_true() -> bool {
    true
}
fn default_hybrid_alpha() -> f64 {
    0.5
}
fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            overlap_enabled: true,
            hybrid_search: true,
            hybrid_alpha: default_hybrid_alpha(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
        }
    }
}

impl KbConfig {
    /// Whether switching from `self` to `other` invalidates stored chunks
    /// or embeddings and therefore requires a full reindex.
    pub fn requires_reindex(&self, other: &KbConfig) -> bool {
        self.embedding_model != other.embedding_model
            || self.chunk_size != other.chunk_size
            || self.chunk_overlap != other.chunk_overlap
            || self.overlap_enabled != other.overlap_enabled
    }

    /// Bounds-check the tunable parameters.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            return Err(Error::InvalidInput("hybrid_alpha must be in [0, 1]".into()));
        }
        if self.bm25_k1 < 0.0 {
            return Err(Error::InvalidInput("bm25_k1 must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(Error::InvalidInput("bm25_b must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Detected document format, from magic bytes with an extension fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Pdf,
    Docx,
    Image,
    Other,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Image => "image",
            DocumentFormat::Other => "other",
        }
    }

    pub fn parse(s: &str) -> DocumentFormat {
        match s {
            "text" => DocumentFormat::Text,
            "pdf" => DocumentFormat::Pdf,
            "docx" => DocumentFormat::Docx,
            "image" => DocumentFormat::Image,
            _ => DocumentFormat::Other,
        }
    }
}

/// Document processing status.
///
/// `Failed` documents keep their metadata row (with a reason) but never
/// have chunks, vectors, or lexical postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Extracting,
    Embedding,
    Ready,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Extracting => "extracting",
            DocStatus::Embedding => "embedding",
            DocStatus::Ready => "ready",
            DocStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DocStatus {
        match s {
            "pending" => DocStatus::Pending,
            "extracting" => DocStatus::Extracting,
            "embedding" => DocStatus::Embedding,
            "ready" => DocStatus::Ready,
            _ => DocStatus::Failed,
        }
    }

    /// Terminal statuses survive a restart; anything else is an
    /// interrupted ingestion and is repaired to `Failed` at startup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocStatus::Ready | DocStatus::Failed)
    }
}

/// An ingested file's metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    /// Original filename as uploaded.
    pub filename: String,
    /// Stored blob path, relative to the KB directory.
    pub stored_path: String,
    pub format: DocumentFormat,
    pub size_bytes: i64,
    /// Unix epoch seconds.
    pub ingested_at: i64,
    pub chunk_count: i64,
    pub status: DocStatus,
    pub error: Option<String>,
}

/// A bounded piece of text derived from a document; the unit of embedding
/// and retrieval. `seq` is dense and 0-based within the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub seq: i64,
    pub text: String,
    pub token_count: i64,
    pub page: Option<i64>,
    pub paragraph: Option<i64>,
}

/// A chunk produced by the chunker before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub text: String,
    pub token_count: usize,
    pub page: Option<i64>,
    pub paragraph: Option<i64>,
}

/// One stored embedding. The `model` tag makes rows stale-detectable after
/// an embedding model change.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub chunk_id: String,
    pub document_id: String,
    pub model: String,
    pub embedding: Vec<f32>,
}

/// A ranked passage returned from the retriever, hydrated with its chunk
/// text and owning-document metadata. `score` is a similarity in `[0, 1]`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub content: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub score: f64,
    pub seq: i64,
    pub document_id: String,
    pub chunk_id: String,
}

/// Query response envelope for the facade.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub elapsed_seconds: f64,
}

/// Aggregate statistics for one knowledge base.
#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub kb_id: String,
    pub name: String,
    pub file_count: i64,
    pub total_size: i64,
    pub total_chunks: i64,
    pub file_types: HashMap<String, i64>,
    pub generation: i64,
}

/// Runtime status of a tool server as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Crashed => "crashed",
        }
    }
}

/// Persisted description of one tool server.
///
/// A single-KB server is just a record whose `kb_ids` has length one; the
/// `kind` discriminator is kept for clients. Tool and parameter
/// description overrides replace the built-in defaults the runtime would
/// otherwise announce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    pub port: u16,
    pub enabled: bool,
    pub kind: ServerKind,
    pub kb_ids: Vec<String>,
    /// Tool name → custom description.
    #[serde(default)]
    pub tool_descriptions: HashMap<String, String>,
    /// Tool name → parameter name → custom description.
    #[serde(default)]
    pub tool_param_descriptions: HashMap<String, HashMap<String, String>>,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    /// Unix epoch seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Single,
    Multi,
}

/// Mutable fields accepted by the supervisor's `update`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub instructions: Option<String>,
    pub kb_ids: Option<Vec<String>>,
    pub tool_descriptions: Option<HashMap<String, String>>,
    pub tool_param_descriptions: Option<HashMap<String, HashMap<String, String>>>,
}

impl ServerUpdate {
    /// Whether applying this update changes what a running server serves
    /// to its clients (and therefore forces a restart).
    pub fn affects_serving(&self) -> bool {
        self.name.is_some()
            || self.instructions.is_some()
            || self.kb_ids.is_some()
            || self.tool_descriptions.is_some()
            || self.tool_param_descriptions.is_some()
    }
}

/// Reindex progress row published to the in-memory progress table and
/// polled by the facade.
#[derive(Debug, Clone, Serialize)]
pub struct ReindexProgress {
    pub processed: u64,
    pub total: u64,
    pub percent: f64,
    pub current_file: Option<String>,
    /// Coarse progress within the current file, in `[0, 100]`.
    pub current_file_progress: f64,
    pub succeeded: u64,
    pub failed: u64,
    /// `in_progress`, `completed`, or `error`.
    pub status: String,
    pub error: Option<String>,
}

impl ReindexProgress {
    pub fn starting(total: u64) -> Self {
        Self {
            processed: 0,
            total,
            percent: 0.0,
            current_file: None,
            current_file_progress: 0.0,
            succeeded: 0,
            failed: 0,
            status: "in_progress".to_string(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = KbConfig::default();
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.chunk_overlap, 50);
        assert!(cfg.overlap_enabled);
        assert!((cfg.hybrid_alpha - 0.5).abs() < 1e-9);
        cfg.validate().unwrap();
    }

    #[test]
    fn reindex_required_only_for_content_affecting_fields() {
        let base = KbConfig::default();

        let mut model = base.clone();
        model.embedding_model = "hash-512".into();
        assert!(base.requires_reindex(&model));

        let mut size = base.clone();
        size.chunk_size = 100;
        assert!(base.requires_reindex(&size));

        let mut alpha = base.clone();
        alpha.hybrid_alpha = 0.9;
        alpha.bm25_k1 = 1.2;
        assert!(!base.requires_reindex(&alpha));
    }

    #[test]
    fn config_validation_bounds() {
        let mut cfg = KbConfig::default();
        cfg.hybrid_alpha = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = KbConfig::default();
        cfg.bm25_b = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = KbConfig::default();
        cfg.chunk_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            DocStatus::Pending,
            DocStatus::Extracting,
            DocStatus::Embedding,
            DocStatus::Ready,
            DocStatus::Failed,
        ] {
            assert_eq!(DocStatus::parse(s.as_str()), s);
        }
        assert!(!DocStatus::Embedding.is_terminal());
        assert!(DocStatus::Failed.is_terminal());
    }

    #[test]
    fn server_update_serving_detection() {
        assert!(!ServerUpdate::default().affects_serving());
        let upd = ServerUpdate {
            instructions: Some("new".into()),
            ..Default::default()
        };
        assert!(upd.affects_serving());
    }
}
