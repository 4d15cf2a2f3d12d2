//! Per-KB BM25 lexical index.
//!
//! An inverted index over the same chunk set as the vector index, stored
//! in `lexical.idx` (SQLite) and mirrored in memory for scoring. Query
//! tokenization is case-folded alphanumeric runs, no stemming.
//!
//! The k1 and b parameters are supplied per query from the KB's current
//! config rather than baked into stored postings, so tuning them takes
//! effect immediately without a reindex.

use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct LexicalIndex {
    path: PathBuf,
    pool: SqlitePool,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    /// term → chunk_id → term frequency.
    postings: HashMap<String, HashMap<String, i64>>,
    /// chunk_id → (document_id, token length).
    chunks: HashMap<String, (String, i64)>,
    total_len: i64,
}

/// Case-folded alphanumeric tokenization shared by indexing and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl LexicalIndex {
    pub async fn open(path: &Path) -> Result<LexicalIndex> {
        let pool = crate::db::open_index_pool(path).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS postings (
                term TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                tf INTEGER NOT NULL,
                PRIMARY KEY (term, chunk_id)
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunk_stats (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                length INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunk_stats_document ON chunk_stats(document_id)",
        )
        .execute(&pool)
        .await?;

        let mut state = State::default();
        let stat_rows = sqlx::query("SELECT chunk_id, document_id, length FROM chunk_stats")
            .fetch_all(&pool)
            .await
            .map_err(|e| Error::IndexCorrupt(format!("{}: {}", path.display(), e)))?;
        for row in &stat_rows {
            let length: i64 = row.get("length");
            state
                .chunks
                .insert(row.get("chunk_id"), (row.get("document_id"), length));
            state.total_len += length;
        }
        let posting_rows = sqlx::query("SELECT term, chunk_id, tf FROM postings")
            .fetch_all(&pool)
            .await?;
        for row in &posting_rows {
            let term: String = row.get("term");
            let chunk_id: String = row.get("chunk_id");
            let tf: i64 = row.get("tf");
            state.postings.entry(term).or_default().insert(chunk_id, tf);
        }

        Ok(LexicalIndex {
            path: path.to_path_buf(),
            pool,
            state: RwLock::new(state),
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().chunks.is_empty()
    }

    /// Index a batch of `(chunk_id, document_id, text)` rows.
    pub async fn add_batch(&self, batch: &[(String, String, String)]) -> Result<()> {
        let mut prepared: Vec<(String, String, HashMap<String, i64>, i64)> = Vec::new();
        for (chunk_id, doc_id, text) in batch {
            let mut counts: HashMap<String, i64> = HashMap::new();
            for token in tokenize(text) {
                *counts.entry(token).or_insert(0) += 1;
            }
            let length: i64 = counts.values().sum();
            prepared.push((chunk_id.clone(), doc_id.clone(), counts, length));
        }

        let mut tx = self.pool.begin().await?;
        for (chunk_id, doc_id, counts, length) in &prepared {
            sqlx::query("INSERT OR REPLACE INTO chunk_stats (chunk_id, document_id, length) VALUES (?, ?, ?)")
                .bind(chunk_id)
                .bind(doc_id)
                .bind(length)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM postings WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
            for (term, tf) in counts {
                sqlx::query("INSERT INTO postings (term, chunk_id, tf) VALUES (?, ?, ?)")
                    .bind(term)
                    .bind(chunk_id)
                    .bind(tf)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        let mut state = self.state.write();
        for (chunk_id, doc_id, counts, length) in prepared {
            if let Some((_, old_len)) = state.chunks.remove(&chunk_id) {
                state.total_len -= old_len;
                remove_postings(&mut state.postings, &chunk_id);
            }
            for (term, tf) in counts {
                state
                    .postings
                    .entry(term)
                    .or_default()
                    .insert(chunk_id.clone(), tf);
            }
            state.chunks.insert(chunk_id, (doc_id, length));
            state.total_len += length;
        }
        Ok(())
    }

    pub async fn delete_by_document(&self, doc_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM postings WHERE chunk_id IN \
             (SELECT chunk_id FROM chunk_stats WHERE document_id = ?)",
        )
        .bind(doc_id)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM chunk_stats WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;

        let mut state = self.state.write();
        let doomed: Vec<String> = state
            .chunks
            .iter()
            .filter(|(_, (d, _))| d == doc_id)
            .map(|(id, _)| id.clone())
            .collect();
        for chunk_id in doomed {
            if let Some((_, len)) = state.chunks.remove(&chunk_id) {
                state.total_len -= len;
            }
            remove_postings(&mut state.postings, &chunk_id);
        }
        Ok(())
    }

    /// BM25 top-k for a query with the supplied parameters.
    pub fn search(&self, query: &str, k: usize, k1: f64, b: f64) -> Vec<(String, f64)> {
        let state = self.state.read();
        if state.chunks.is_empty() {
            return Vec::new();
        }

        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let n = state.chunks.len() as f64;
        let avg_len = state.total_len as f64 / n;

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in &terms {
            let Some(postings) = state.postings.get(term) else {
                continue;
            };
            let df = postings.len() as f64;
            // Lucene-style idf: strictly positive even when a term occurs
            // in every chunk, which matters for tiny knowledge bases.
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (chunk_id, tf) in postings {
                let Some((_, len)) = state.chunks.get(chunk_id) else {
                    continue;
                };
                let tf = *tf as f64;
                let denom = tf + k1 * (1.0 - b + b * (*len as f64 / avg_len));
                if denom <= 0.0 {
                    continue;
                }
                *scores.entry(chunk_id.as_str()).or_insert(0.0) +=
                    idf * (tf * (k1 + 1.0)) / denom;
            }
        }

        let mut hits: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }

    /// Drop postings for chunks no longer present in `meta.db`.
    pub async fn retain_chunks(&self, live: &HashSet<String>) -> Result<u64> {
        let stale: Vec<String> = {
            let state = self.state.read();
            state
                .chunks
                .keys()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for id in &stale {
            sqlx::query("DELETE FROM postings WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunk_stats WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let mut state = self.state.write();
        for id in &stale {
            if let Some((_, len)) = state.chunks.remove(id) {
                state.total_len -= len;
            }
            remove_postings(&mut state.postings, id);
        }
        Ok(stale.len() as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn remove_postings(postings: &mut HashMap<String, HashMap<String, i64>>, chunk_id: &str) {
    postings.retain(|_, per_chunk| {
        per_chunk.remove(chunk_id);
        !per_chunk.is_empty()
    });
}
