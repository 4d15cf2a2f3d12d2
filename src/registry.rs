//! Knowledge-base registry: CRUD, configuration, and the KB-event wiring
//! into the tool-server supervisor.
//!
//! The registry and the supervisor never hold references to each other's
//! objects; tool-server records carry KB ids only, and every event
//! crossing the boundary is a method call with plain data. Deleting a KB
//! cascades: blobs, metadata, both indices, and any tool server whose KB
//! set becomes empty.

use std::sync::atomic::Ordering;

use crate::config;
use crate::error::{Error, Result};
use crate::lexical_index::LexicalIndex;
use crate::models::{KbConfig, KnowledgeBase, ServerUpdate, ToolServerRecord};
use crate::search::IndexPair;
use crate::storage::KbStorage;
use crate::supervisor::CreateServer;
use crate::vector_index::VectorIndex;

use crate::engine::{Engine, KbHandle};

impl Engine {
    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::Internal("engine is read-only in this process".into()));
        }
        Ok(())
    }

    async fn name_taken(&self, name: &str, excluding: Option<&str>) -> Result<bool> {
        for kb in self.list_kbs().await? {
            if kb.name == name && Some(kb.id.as_str()) != excluding {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create a knowledge base with default configuration and a default
    /// (stopped) tool server.
    pub async fn create_kb(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<KnowledgeBase> {
        self.ensure_writable()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("knowledge base name must not be empty".into()));
        }
        if self.name_taken(name, None).await? {
            return Err(Error::Conflict(format!(
                "knowledge base named '{}' already exists",
                name
            )));
        }

        let kb_id = uuid::Uuid::new_v4().to_string();
        let cfg = KbConfig::default();
        let storage = KbStorage::create(self.root(), &kb_id, name, description, &cfg).await?;
        let kb = storage.kb().await?;

        let vector = VectorIndex::open(&config::vector_idx_path(self.root(), &kb_id)).await?;
        let lexical = LexicalIndex::open(&config::lexical_idx_path(self.root(), &kb_id)).await?;

        self.insert_handle(
            &kb_id,
            KbHandle {
                id: kb_id.clone(),
                storage,
                indices: parking_lot::RwLock::new(std::sync::Arc::new(IndexPair {
                    vector,
                    lexical,
                })),
                write_lock: tokio::sync::Mutex::new(()),
                reindexing: std::sync::atomic::AtomicBool::new(false),
            },
        );

        self.supervisor.on_kb_created(&kb_id, name).await;
        tracing::info!(kb = %kb_id, name, "knowledge base created");
        Ok(kb)
    }

    pub async fn list_kbs(&self) -> Result<Vec<KnowledgeBase>> {
        let mut kbs = Vec::new();
        for handle in self.handles() {
            kbs.push(handle.storage.kb().await?);
        }
        kbs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(kbs)
    }

    /// Rename; the id stays stable and affected running tool servers
    /// restart so their announced metadata follows.
    pub async fn rename_kb(&self, kb_id: &str, new_name: &str) -> Result<KnowledgeBase> {
        self.ensure_writable()?;
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::InvalidInput("knowledge base name must not be empty".into()));
        }
        if self.name_taken(new_name, Some(kb_id)).await? {
            return Err(Error::Conflict(format!(
                "knowledge base named '{}' already exists",
                new_name
            )));
        }

        let handle = self.handle(kb_id)?;
        let old = handle.storage.kb().await?;
        handle.storage.rename_kb(new_name).await?;
        self.supervisor
            .on_kb_renamed(kb_id, &old.name, new_name)
            .await?;
        tracing::info!(kb = %kb_id, from = %old.name, to = %new_name, "knowledge base renamed");
        handle.storage.kb().await
    }

    pub async fn set_kb_description(
        &self,
        kb_id: &str,
        description: Option<&str>,
    ) -> Result<KnowledgeBase> {
        self.ensure_writable()?;
        let handle = self.handle(kb_id)?;
        handle.storage.set_description(description).await?;
        handle.storage.kb().await
    }

    /// Delete the KB and everything it owns. Refused while a reindex is
    /// in flight.
    pub async fn delete_kb(&self, kb_id: &str) -> Result<()> {
        self.ensure_writable()?;
        let handle = self.handle(kb_id)?;
        if handle.reindexing.load(Ordering::SeqCst) {
            return Err(Error::Conflict("reindex in progress".into()));
        }

        {
            let _guard = handle.write_lock.lock().await;
            self.remove_handle(kb_id);
            handle.storage.close().await;
            let indices = handle.current_indices();
            indices.vector.close().await;
            indices.lexical.close().await;
        }

        std::fs::remove_dir_all(config::kb_dir(self.root(), kb_id))?;
        self.supervisor.on_kb_deleted(kb_id).await?;
        tracing::info!(kb = %kb_id, "knowledge base deleted");
        Ok(())
    }

    /// Store a new config. Returns `true` when the change invalidates
    /// chunks or embeddings and the caller should trigger a reindex;
    /// retrieval-only parameters take effect on the next query.
    pub async fn put_config(&self, kb_id: &str, cfg: &KbConfig) -> Result<bool> {
        self.ensure_writable()?;
        cfg.validate()?;
        // Probe the model id early so a typo surfaces here, not mid-reindex.
        self.embedder_for(&cfg.embedding_model)?;

        let handle = self.handle(kb_id)?;
        let old = handle.storage.kb().await?.config;
        handle.storage.put_config(cfg).await?;
        let needs_reindex = old.requires_reindex(cfg);
        if needs_reindex {
            tracing::info!(kb = %kb_id, "config change requires reindex");
        }
        Ok(needs_reindex)
    }

    // ── Tool servers ─────────────────────────────────────────────────────

    fn validate_kb_ids(&self, kb_ids: &[String]) -> Result<()> {
        for kb_id in kb_ids {
            self.handle(kb_id)?;
        }
        Ok(())
    }

    pub async fn create_tool_server(&self, req: CreateServer) -> Result<ToolServerRecord> {
        self.ensure_writable()?;
        self.validate_kb_ids(&req.kb_ids)?;
        self.supervisor.create(req).await
    }

    pub async fn update_tool_server(
        &self,
        id: &str,
        upd: ServerUpdate,
    ) -> Result<ToolServerRecord> {
        self.ensure_writable()?;
        if let Some(kb_ids) = &upd.kb_ids {
            self.validate_kb_ids(kb_ids)?;
        }
        self.supervisor.update(id, upd).await
    }

    /// A server's tool configuration with built-in defaults and overrides
    /// resolved, as presented to clients managing descriptions.
    pub async fn tool_server_config(&self, id: &str) -> Result<serde_json::Value> {
        let record = self.supervisor.get(id).await?;
        let mut kb_names = Vec::new();
        for kb_id in &record.kb_ids {
            if let Ok(kb) = self.get_kb(kb_id).await {
                kb_names.push(kb.name);
            }
        }
        Ok(crate::toolserver::resolved_tool_config(&record, &kb_names))
    }
}
