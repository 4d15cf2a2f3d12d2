//! Embedding providers and vector utilities.
//!
//! The [`EmbeddingProvider`] trait is the contract between the pipeline,
//! the query path, and whatever produces vectors. Providers are shared as
//! a single `Arc` across every KB and must be safe under concurrent calls.
//! All vectors are L2-normalized before they leave a provider, so cosine
//! similarity downstream is a plain dot product.
//!
//! Two implementations:
//!
//! - [`HashEmbedder`] — deterministic local provider using SHA-256 token
//!   feature hashing. No model download, no network; the default for new
//!   knowledge bases (model ids `hash-<dims>`).
//! - [`RemoteEmbedder`] — OpenAI-compatible `POST /v1/embeddings` with
//!   batching, bounded retry, and exponential backoff.
//!
//! # Retry strategy
//!
//! Transient failures (HTTP 429, 5xx, network errors) are retried up to 3
//! attempts with 1s/2s backoff. Other 4xx responses are permanent and
//! propagate as `embedding_failed`; during ingestion that fails the
//! document, not the batch.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Number of texts per embedding call from the pipeline.
pub const BATCH_SIZE: usize = 32;

/// Per-batch wall-clock budget.
pub const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded next to every vector row.
    fn model_id(&self) -> &str;

    /// Fixed output dimensionality.
    fn dimension(&self) -> usize;

    /// Whether identical input always yields identical output (enables
    /// caching layers above).
    fn deterministic(&self) -> bool {
        false
    }

    /// Token counter used by the chunker so chunk budgets line up with
    /// what gets embedded.
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    /// Embed a batch of texts, one L2-normalized vector per input, in
    /// input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate a provider from a model id. Ids of the form `hash-<dims>`
/// resolve to the local hashing provider; anything else is treated as a
/// remote model name.
pub fn create_provider(model_id: &str) -> Result<Arc<dyn EmbeddingProvider>> {
    if let Some(dims) = model_id.strip_prefix("hash-") {
        let dims: usize = dims
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad embedding model id: {}", model_id)))?;
        if dims == 0 || dims > 4096 {
            return Err(Error::InvalidInput(format!(
                "embedding dimension out of range: {}",
                dims
            )));
        }
        return Ok(Arc::new(HashEmbedder::new(dims)));
    }
    Ok(Arc::new(RemoteEmbedder::new(model_id)?))
}

// ── Local hashing provider ──────────────────────────────────────────────

/// Deterministic feature-hashing embedder.
///
/// Each token is hashed with SHA-256; the first eight bytes choose a
/// bucket and the ninth selects the sign. The resulting count vector is
/// L2-normalized. Not a learned representation, but deterministic, fast,
/// and good enough for lexical-overlap similarity; real deployments point
/// a KB's `embedding_model` at a remote model instead.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hash-{}", dims),
            dims,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket =
                u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes")) as usize
                    % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    fn deterministic(&self) -> bool {
        true
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ── Remote provider ─────────────────────────────────────────────────────

/// Known remote model dimensionalities; unknown models default to 1536.
fn remote_dims(model: &str) -> usize {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

/// OpenAI-compatible embeddings client.
///
/// Reads `OPENAI_API_KEY` (required) and `OPENAI_BASE_URL` (optional,
/// defaults to the OpenAI endpoint) from the environment.
pub struct RemoteEmbedder {
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            Error::EmbeddingFailed(format!(
                "OPENAI_API_KEY not set (required for model '{}')",
                model
            ))
        })?;
        let base = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            model: model.to_string(),
            dims: remote_dims(model),
            endpoint: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            client,
        })
    }

    async fn call_once(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RemoteError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| RemoteError::Permanent(e.to_string()))?;
            return parse_embeddings_response(&json).map_err(RemoteError::Permanent);
        }

        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(RemoteError::Transient(format!("{}: {}", status, text)))
        } else {
            Err(RemoteError::Permanent(format!("{}: {}", status, text)))
        }
    }
}

enum RemoteError {
    Transient(String),
    Permanent(String),
}

fn parse_embeddings_response(json: &serde_json::Value) -> std::result::Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| "response missing data array".to_string())?;

    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| "response item missing embedding".to_string())?;
        let mut v: Vec<f32> = embedding
            .iter()
            .map(|x| x.as_f64().unwrap_or(0.0) as f32)
            .collect();
        l2_normalize(&mut v);
        out.push(v);
    }
    Ok(out)
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
            match self.call_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(RemoteError::Transient(msg)) => {
                    tracing::warn!(attempt, error = %msg, "transient embedding failure");
                    last_err = msg;
                }
                Err(RemoteError::Permanent(msg)) => {
                    return Err(Error::EmbeddingFailed(msg));
                }
            }
        }
        Err(Error::EmbeddingFailed(format!(
            "exhausted {} attempts: {}",
            MAX_ATTEMPTS, last_err
        )))
    }
}

// ── Vector utilities ────────────────────────────────────────────────────

/// Normalize in place; the zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product; equals cosine similarity for normalized inputs. Returns
/// 0.0 on dimension mismatch rather than panicking.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let provider = HashEmbedder::new(64);
        let texts = vec!["the quick brown fox".to_string()];
        let a = provider.embed(&texts).await.unwrap();
        let b = provider.embed(&texts).await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_embedder_similar_text_scores_higher() {
        let provider = HashEmbedder::new(256);
        let vs = provider
            .embed(&[
                "the lazy dog sleeps".to_string(),
                "the lazy dog naps".to_string(),
                "quantum flux capacitor maintenance".to_string(),
            ])
            .await
            .unwrap();
        let close = dot(&vs[0], &vs[1]);
        let far = dot(&vs[0], &vs[2]);
        assert!(close > far, "close={} far={}", close, far);
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let provider = HashEmbedder::new(32);
        let v = provider.embed(&["   ".to_string()]).await.unwrap();
        assert!(v[0].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn provider_dispatch() {
        let p = create_provider("hash-128").unwrap();
        assert_eq!(p.model_id(), "hash-128");
        assert_eq!(p.dimension(), 128);
        assert!(p.deterministic());

        assert!(create_provider("hash-0").is_err());
        assert!(create_provider("hash-abc").is_err());
    }

    #[test]
    fn dot_handles_mismatched_lengths() {
        assert_eq!(dot(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn token_counter_counts_words() {
        let p = HashEmbedder::new(16);
        assert_eq!(p.count_tokens("one two  three"), 3);
        assert_eq!(p.count_tokens(""), 0);
    }
}
