//! # docbase
//!
//! **Self-hosted knowledge bases with hybrid retrieval and per-KB tool
//! servers.**
//!
//! Users upload heterogeneous documents (plain text, PDF, DOCX, images);
//! docbase extracts text, chunks it token-aware, embeds each chunk into a
//! unit vector, and persists raw bytes plus embeddings so natural-language
//! queries return ranked passages. Every knowledge base can additionally
//! be exposed to external AI agents as a tool server: a supervised child
//! process speaking a small JSON tool protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌─────────────────────┐
//! │  Upload  │──▶│     Pipeline      │──▶│  Per-KB storage      │
//! │  (bytes) │   │ extract→chunk→    │   │ meta.db + vector.idx │
//! └──────────┘   │ embed→commit      │   │ + lexical.idx        │
//!                └───────────────────┘   └──────────┬──────────┘
//!                                                   │
//!                          ┌────────────────────────┤
//!                          ▼                        ▼
//!                   ┌────────────┐          ┌───────────────┐
//!                   │   Query    │          │  Supervisor   │
//!                   │ (hybrid)   │          │ tool servers  │
//!                   └────────────┘          └───────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. An upload lands in the [`pipeline`]: blob write, format detection
//!    ([`extract`]), token-aware chunking ([`chunker`]), batched
//!    embedding ([`embedding`]), then a transactional commit into
//!    [`storage`] with rows in both the [`vector_index`] and the
//!    [`lexical_index`].
//! 2. A query embeds once, fetches candidates from both indices, and
//!    fuses them with min-max normalization and a configurable α
//!    ([`search`]).
//! 3. The [`supervisor`] keeps one [`toolserver`] child per enabled
//!    record, reacting to KB create/rename/delete events.
//! 4. Config changes that invalidate embeddings trigger the [`reindex`]
//!    controller: shadow rebuild, atomic swap, generation bump.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core types: `KnowledgeBase`, `Document`, `Chunk`, `ToolServerRecord` |
//! | [`config`] | `config.json` and the data-root layout |
//! | [`error`] | Error kinds shared across the engine |
//! | [`storage`] | Blob store + per-KB `meta.db` with crash repair |
//! | [`extract`] | Format detection and per-format extractors |
//! | [`chunker`] | Token-aware splitting with optional overlap |
//! | [`embedding`] | Provider trait, local hashing provider, remote client |
//! | [`vector_index`] | Per-KB cosine index with in-memory scan cache |
//! | [`lexical_index`] | Per-KB BM25 index with tunable k1/b |
//! | [`search`] | Hybrid fusion and result hydration |
//! | [`pipeline`] | Ingestion orchestration with failure isolation |
//! | [`reindex`] | Shadow rebuild and atomic index swap |
//! | [`engine`] | Coordinator: per-KB handles, locks, providers |
//! | [`registry`] | KB CRUD and KB-event wiring |
//! | [`supervisor`] | Tool-server lifecycle and port allocation |
//! | [`toolserver`] | Child-process tool runtime (axum) |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod lexical_index;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod reindex;
pub mod search;
pub mod storage;
pub mod supervisor;
pub mod toolserver;
pub mod vector_index;
