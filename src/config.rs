//! Instance configuration and data-root layout.
//!
//! The data root holds everything one docbase instance owns:
//!
//! ```text
//! <root>/
//!   config.json                 -- ports (all fields optional)
//!   knowledge-bases/
//!     <kb-id>/
//!       blobs/<doc-id>.<ext>
//!       meta.db                 -- kb row, documents, chunks
//!       vector.idx              -- embedding vectors
//!       lexical.idx             -- BM25 postings
//!   tool-servers.json           -- ToolServerRecord array
//!   logs/
//! ```
//!
//! `config.json` is read once at startup; a missing file means defaults.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "default_frontend_port")]
    pub port: u16,
}

/// Port range handed to the tool-server supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,
}

fn default_backend_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_frontend_port() -> u16 {
    3000
}
fn default_start_port() -> u16 {
    8100
}
fn default_max_port() -> u16 {
    8200
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: default_backend_port(),
            host: default_host(),
        }
    }
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            port: default_frontend_port(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            max_port: default_max_port(),
        }
    }
}

impl AppConfig {
    /// Load `<root>/config.json`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<AppConfig> {
        let path = root.join("config.json");
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| Error::InvalidInput(format!("config.json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mcp.start_port > self.mcp.max_port {
            return Err(Error::InvalidInput(format!(
                "mcp.start_port {} exceeds mcp.max_port {}",
                self.mcp.start_port, self.mcp.max_port
            )));
        }
        Ok(())
    }
}

/// Create the data-root directory skeleton and a default `config.json`
/// when none exists. Idempotent.
pub fn init_root(root: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(root.join("knowledge-bases"))
        .with_context(|| format!("creating {}", root.display()))?;
    std::fs::create_dir_all(root.join("logs"))?;
    let config_path = root.join("config.json");
    if !config_path.exists() {
        let default = serde_json::to_string_pretty(&AppConfig::default())?;
        std::fs::write(&config_path, default)?;
    }
    Ok(())
}

// Layout helpers. All paths below the data root funnel through these so
// the on-disk shape is defined in one place.

pub fn kbs_dir(root: &Path) -> PathBuf {
    root.join("knowledge-bases")
}

pub fn kb_dir(root: &Path, kb_id: &str) -> PathBuf {
    kbs_dir(root).join(kb_id)
}

pub fn blobs_dir(root: &Path, kb_id: &str) -> PathBuf {
    kb_dir(root, kb_id).join("blobs")
}

pub fn meta_path(root: &Path, kb_id: &str) -> PathBuf {
    kb_dir(root, kb_id).join("meta.db")
}

pub fn vector_idx_path(root: &Path, kb_id: &str) -> PathBuf {
    kb_dir(root, kb_id).join("vector.idx")
}

pub fn lexical_idx_path(root: &Path, kb_id: &str) -> PathBuf {
    kb_dir(root, kb_id).join("lexical.idx")
}

pub fn servers_path(root: &Path) -> PathBuf {
    root.join("tool-servers.json")
}

pub fn lockfile_path(root: &Path) -> PathBuf {
    root.join(".lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = AppConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.backend.port, 8000);
        assert_eq!(cfg.mcp.start_port, 8100);
        assert_eq!(cfg.mcp.max_port, 8200);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{ "mcp": { "start_port": 9000, "max_port": 9010 } }"#,
        )
        .unwrap();
        let cfg = AppConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.mcp.start_port, 9000);
        assert_eq!(cfg.backend.port, 8000);
    }

    #[test]
    fn inverted_port_range_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{ "mcp": { "start_port": 9010, "max_port": 9000 } }"#,
        )
        .unwrap();
        assert!(AppConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn init_root_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        init_root(tmp.path()).unwrap();
        init_root(tmp.path()).unwrap();
        assert!(tmp.path().join("config.json").exists());
        assert!(kbs_dir(tmp.path()).exists());
    }
}
