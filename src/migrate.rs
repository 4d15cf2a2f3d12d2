//! Per-KB `meta.db` schema.
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌──────────────┐
//! │      kb      │     │  documents    │──┐  │    chunks    │
//! │              │     │               │  │  │              │
//! │ id (PK)      │     │ id (PK)       │  └──│ document_id  │
//! │ name         │     │ filename      │     │ id (PK)      │
//! │ description  │     │ stored_path   │     │ seq          │
//! │ created_at   │     │ format        │     │ text         │
//! │ config_json  │     │ size_bytes    │     │ token_count  │
//! │ generation   │     │ ingested_at   │     │ page         │
//! └──────────────┘     │ chunk_count   │     │ paragraph    │
//!                      │ status        │     └──────────────┘
//!                      │ error         │
//!                      └───────────────┘
//! ```
//!
//! The `kb` table holds exactly one row. Vector and lexical data live in
//! their own files (`vector.idx`, `lexical.idx`); `meta.db` is the single
//! source of truth for chunk text. All statements are idempotent.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn init_kb_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at INTEGER NOT NULL,
            config_json TEXT NOT NULL,
            generation INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            stored_path TEXT NOT NULL,
            format TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            page INTEGER,
            paragraph INTEGER,
            UNIQUE(document_id, seq),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
        .execute(pool)
        .await?;

    Ok(())
}
