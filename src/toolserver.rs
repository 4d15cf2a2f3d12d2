//! Tool-server runtime: the child process serving one record.
//!
//! Spawned by the supervisor as `docbase toolserve --root <root>
//! --server-id <id>`. Reads its record from `tool-servers.json`, opens
//! the engine read-only, and serves three tools as JSON over HTTP on the
//! assigned port:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | Tool descriptors with resolved descriptions |
//! | `POST` | `/tools/search` | Ranked passages from the served KBs |
//! | `POST` | `/tools/info` | KB metadata, counts, and instructions |
//! | `POST` | `/tools/list_documents` | Filenames in the served KBs |
//! | `GET`  | `/health` | Readiness probe used by the supervisor |
//! | `POST` | `/shutdown` | Graceful-exit handshake (exit code 0) |
//!
//! Tool and parameter descriptions come from the record's overrides,
//! falling back to built-in defaults that mention the KB by name. A
//! multi-KB server accepts an optional `kb` selector (name or id) on
//! `search` and `list_documents`; without it, all served KBs are
//! queried and merged by score.
//!
//! Errors follow the engine's error contract:
//!
//! ```json
//! { "error": { "kind": "invalid_input", "message": "query must not be empty" } }
//! ```

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::error::Error;
use crate::models::{ServerKind, ToolServerRecord};

struct ToolState {
    engine: Engine,
    record: ToolServerRecord,
    /// `(kb_id, kb_name)` captured at startup; a rename restarts us.
    kbs: Vec<(String, String)>,
    shutdown: tokio::sync::Notify,
}

/// Entry point for the `toolserve` subcommand.
pub async fn run_toolserver(root: &Path, server_id: &str) -> anyhow::Result<()> {
    let engine = Engine::open_read_only(root).await?;
    let record = engine.supervisor.get(server_id).await?;

    let mut kbs = Vec::new();
    for kb_id in &record.kb_ids {
        match engine.get_kb(kb_id).await {
            Ok(kb) => kbs.push((kb.id, kb.name)),
            Err(e) => tracing::warn!(kb = %kb_id, error = %e, "served knowledge base unavailable"),
        }
    }
    if kbs.is_empty() {
        anyhow::bail!("tool server {} has no resolvable knowledge bases", server_id);
    }

    let port = record.port;
    let state = Arc::new(ToolState {
        engine,
        record,
        kbs,
        shutdown: tokio::sync::Notify::new(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/search", post(handle_search))
        .route("/tools/info", post(handle_info))
        .route("/tools/list_documents", post(handle_list_documents))
        .route("/health", get(handle_health))
        .route("/shutdown", post(handle_shutdown))
        .layer(cors)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(server = %state.record.id, port, "tool server listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_state.shutdown.notified().await;
        })
        .await?;

    tracing::info!(server = %state.record.id, "tool server exiting");
    Ok(())
}

// ── Error plumbing ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::InvalidInput(_) | Error::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

// ── Tool descriptions ───────────────────────────────────────────────────

const TOOL_SEARCH: &str = "search";
const TOOL_INFO: &str = "info";
const TOOL_LIST_DOCUMENTS: &str = "list_documents";

pub const TOOL_NAMES: [&str; 3] = [TOOL_SEARCH, TOOL_INFO, TOOL_LIST_DOCUMENTS];

/// Built-in tool description for a server over the named KBs.
pub fn default_tool_description(tool: &str, kb_names: &[String]) -> String {
    let names = kb_names
        .iter()
        .map(|n| format!("'{}'", n))
        .collect::<Vec<_>>()
        .join(", ");
    match tool {
        TOOL_SEARCH => format!("Search the {} knowledge base using hybrid search", names),
        TOOL_INFO => format!("Get information about the {} knowledge base", names),
        TOOL_LIST_DOCUMENTS => format!("List all documents in the {} knowledge base", names),
        _ => String::new(),
    }
}

/// Built-in parameter description, or empty for unknown parameters.
pub fn default_param_description(tool: &str, param: &str) -> &'static str {
    match (tool, param) {
        (TOOL_SEARCH, "query") => "Search query to find relevant documents",
        (TOOL_SEARCH, "limit") => "Maximum number of results to return (default: 5)",
        (TOOL_SEARCH, "kb") => "Knowledge base name or id to search (defaults to all)",
        (TOOL_LIST_DOCUMENTS, "limit") => "Maximum number of filenames to return",
        _ => "",
    }
}

/// The fully resolved tool configuration for a record: built-in defaults
/// with the record's overrides applied. This is what the REST facade
/// shows when asked for a server's tool config.
pub fn resolved_tool_config(
    record: &ToolServerRecord,
    kb_names: &[String],
) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = TOOL_NAMES
        .into_iter()
        .map(|tool| {
            let description = record
                .tool_descriptions
                .get(tool)
                .cloned()
                .unwrap_or_else(|| default_tool_description(tool, kb_names));
            let params: serde_json::Map<String, serde_json::Value> = ["query", "limit", "kb"]
                .into_iter()
                .filter(|p| !default_param_description(tool, p).is_empty())
                .map(|p| {
                    let desc = record
                        .tool_param_descriptions
                        .get(tool)
                        .and_then(|m| m.get(p))
                        .cloned()
                        .unwrap_or_else(|| default_param_description(tool, p).to_string());
                    (p.to_string(), serde_json::Value::String(desc))
                })
                .collect();
            serde_json::json!({
                "name": tool,
                "description": description,
                "overridden": record.tool_descriptions.contains_key(tool),
                "parameters": params,
            })
        })
        .collect();

    serde_json::json!({
        "server_id": record.id,
        "instructions": record.instructions,
        "tools": tools,
    })
}

impl ToolState {
    fn tool_description(&self, tool: &str) -> String {
        self.record
            .tool_descriptions
            .get(tool)
            .cloned()
            .unwrap_or_else(|| {
                let names: Vec<String> = self.kbs.iter().map(|(_, n)| n.clone()).collect();
                default_tool_description(tool, &names)
            })
    }

    fn param_description(&self, tool: &str, param: &str) -> String {
        self.record
            .tool_param_descriptions
            .get(tool)
            .and_then(|m| m.get(param))
            .cloned()
            .unwrap_or_else(|| default_param_description(tool, param).to_string())
    }

    fn search_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::json!({
            "query": {
                "type": "string",
                "description": self.param_description(TOOL_SEARCH, "query"),
            },
            "limit": {
                "type": "number",
                "description": self.param_description(TOOL_SEARCH, "limit"),
                "minimum": 1,
                "maximum": 20,
            },
        });
        if self.record.kind == ServerKind::Multi {
            properties["kb"] = serde_json::json!({
                "type": "string",
                "description": self.param_description(TOOL_SEARCH, "kb"),
            });
        }
        serde_json::json!({
            "type": "object",
            "required": ["query"],
            "properties": properties,
        })
    }

    /// Resolve a `kb` selector (name or id) to served KB ids.
    fn select_kbs(&self, selector: Option<&str>) -> Result<Vec<(String, String)>, AppError> {
        match selector {
            None => Ok(self.kbs.clone()),
            Some(sel) => {
                let matched: Vec<(String, String)> = self
                    .kbs
                    .iter()
                    .filter(|(id, name)| id == sel || name == sel)
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    Err(Error::NotFound(format!("knowledge base '{}' is not served here", sel))
                        .into())
                } else {
                    Ok(matched)
                }
            }
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ToolDescriptor {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

async fn handle_list_tools(State(state): State<Arc<ToolState>>) -> Json<serde_json::Value> {
    let tools = vec![
        ToolDescriptor {
            name: TOOL_SEARCH.to_string(),
            description: state.tool_description(TOOL_SEARCH),
            parameters: state.search_schema(),
        },
        ToolDescriptor {
            name: TOOL_INFO.to_string(),
            description: state.tool_description(TOOL_INFO),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        },
        ToolDescriptor {
            name: TOOL_LIST_DOCUMENTS.to_string(),
            description: state.tool_description(TOOL_LIST_DOCUMENTS),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "number",
                        "description": state.param_description(TOOL_LIST_DOCUMENTS, "limit"),
                    }
                }
            }),
        },
    ];
    Json(serde_json::json!({
        "server": state.record.name,
        "instructions": state.record.instructions,
        "tools": tools,
    }))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    kb: Option<String>,
}

fn default_search_limit() -> usize {
    5
}

#[derive(Serialize)]
struct ToolSearchResult {
    content: String,
    filename: String,
    score: f64,
}

async fn handle_search(
    State(state): State<Arc<ToolState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.query.trim().is_empty() {
        return Err(Error::InvalidInput("query must not be empty".into()).into());
    }
    let limit = req.limit.clamp(1, 20);

    let mut merged: Vec<ToolSearchResult> = Vec::new();
    for (kb_id, _) in state.select_kbs(req.kb.as_deref())? {
        let response = state.engine.query(&kb_id, &req.query, limit).await?;
        merged.extend(response.results.into_iter().map(|r| ToolSearchResult {
            content: r.content,
            filename: r.filename,
            score: r.score,
        }));
    }
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);

    Ok(Json(serde_json::json!({ "results": merged })))
}

async fn handle_info(
    State(state): State<Arc<ToolState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut infos = Vec::new();
    for (kb_id, _) in &state.kbs {
        let kb = state.engine.get_kb(kb_id).await?;
        let stats = state.engine.stats(kb_id).await?;
        infos.push(serde_json::json!({
            "id": kb.id,
            "name": kb.name,
            "description": kb.description,
            "created_at": kb.created_at,
            "file_count": stats.file_count,
            "total_chunks": stats.total_chunks,
        }));
    }

    let body = if state.record.kind == ServerKind::Single {
        let mut info = infos.remove(0);
        info["instructions"] = serde_json::json!(state.record.instructions);
        info
    } else {
        serde_json::json!({
            "server": state.record.name,
            "instructions": state.record.instructions,
            "knowledge_bases": infos,
        })
    };
    Ok(Json(body))
}

#[derive(Deserialize, Default)]
struct ListDocumentsRequest {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    kb: Option<String>,
}

async fn handle_list_documents(
    State(state): State<Arc<ToolState>>,
    body: Option<Json<ListDocumentsRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    let mut filenames = Vec::new();
    for (kb_id, _) in state.select_kbs(req.kb.as_deref())? {
        for doc in state.engine.list_documents(&kb_id).await? {
            filenames.push(doc.filename);
        }
    }
    if let Some(limit) = req.limit {
        filenames.truncate(limit);
    }
    Ok(Json(serde_json::json!({ "documents": filenames })))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    server: String,
    version: String,
}

async fn handle_health(State(state): State<Arc<ToolState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        server: state.record.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_shutdown(State(state): State<Arc<ToolState>>) -> Json<serde_json::Value> {
    state.shutdown.notify_one();
    Json(serde_json::json!({ "status": "stopping" }))
}
