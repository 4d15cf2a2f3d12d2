//! Tool-server supervisor.
//!
//! Maintains the set of tool servers declared in `tool-servers.json` and
//! keeps one child process per enabled record running on its assigned
//! port. Children are this same binary re-invoked with the hidden
//! `toolserve` subcommand; the supervisor never binds a tool port itself,
//! it only probes availability (bind, then release) and lets the child
//! bind.
//!
//! # Lifecycle
//!
//! ```text
//! stopped → starting → running → (stopping → stopped) | crashed
//! ```
//!
//! A child that exits 0 is `stopped`; non-zero is `crashed`. From
//! `crashed` the supervisor restarts automatically up to 3 times within a
//! 60 s window, after which the record stays `crashed` with the last
//! error until someone intervenes.
//!
//! Stop is graceful-first: `POST /shutdown`, wait up to 5 s, then kill.
//! Start waits up to 10 s for the child's `/health` to answer.
//!
//! Updates that change what a running server serves (name, instructions,
//! KB set, tool or parameter descriptions) restart it on the same port so
//! clients observe a brief disconnect rather than stale metadata.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{self, AppConfig};
use crate::error::{Error, Result};
use crate::models::{ServerKind, ServerStatus, ServerUpdate, ToolServerRecord};

const START_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_WINDOW: Duration = Duration::from_secs(60);
const MAX_RESTARTS: usize = 3;

/// Fields for a new tool server. KB ids are validated by the caller
/// against the KB registry before this reaches the supervisor.
#[derive(Debug, Clone)]
pub struct CreateServer {
    pub name: String,
    pub instructions: String,
    pub kb_ids: Vec<String>,
    pub tool_descriptions: HashMap<String, String>,
    pub tool_param_descriptions: HashMap<String, HashMap<String, String>>,
    pub requested_port: Option<u16>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

struct Inner {
    root: PathBuf,
    start_port: u16,
    max_port: u16,
    read_only: bool,
    state: tokio::sync::Mutex<SupState>,
}

#[derive(Default)]
struct SupState {
    records: Vec<ToolServerRecord>,
    children: HashMap<String, ChildHandle>,
    /// Servers being intentionally stopped; their exit is not a crash.
    stopping: HashSet<String>,
    /// Recent automatic restart timestamps per server.
    restarts: HashMap<String, Vec<Instant>>,
}

struct ChildHandle {
    kill_tx: tokio::sync::oneshot::Sender<()>,
}

/// Probe availability by binding and immediately releasing.
fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

impl Supervisor {
    /// Load records from `tool-servers.json`. Read-write instances
    /// reconcile stale statuses: a `starting` record is `stopped`, and a
    /// `running` record whose port nobody is listening on is `stopped`.
    pub fn load(root: &Path, app: &AppConfig, read_only: bool) -> Result<Supervisor> {
        let path = config::servers_path(root);
        let mut records: Vec<ToolServerRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::StorageFailed(format!("tool-servers.json: {}", e)))?
        } else {
            Vec::new()
        };

        if !read_only {
            let mut dirty = false;
            for rec in &mut records {
                match rec.status {
                    ServerStatus::Starting => {
                        rec.status = ServerStatus::Stopped;
                        dirty = true;
                    }
                    ServerStatus::Running if port_is_free(rec.port) => {
                        rec.status = ServerStatus::Stopped;
                        dirty = true;
                    }
                    _ => {}
                }
            }
            if dirty {
                save_records(root, &records)?;
            }
        }

        Ok(Supervisor {
            inner: Arc::new(Inner {
                root: root.to_path_buf(),
                start_port: app.mcp.start_port,
                max_port: app.mcp.max_port,
                read_only,
                state: tokio::sync::Mutex::new(SupState {
                    records,
                    ..Default::default()
                }),
            }),
        })
    }

    pub async fn list(&self) -> Vec<ToolServerRecord> {
        self.inner.state.lock().await.records.clone()
    }

    pub async fn get(&self, id: &str) -> Result<ToolServerRecord> {
        self.inner
            .state
            .lock()
            .await
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tool server {}", id)))
    }

    pub async fn create(&self, req: CreateServer) -> Result<ToolServerRecord> {
        self.inner.ensure_writable()?;
        if req.kb_ids.is_empty() {
            return Err(Error::InvalidInput(
                "a tool server needs at least one knowledge base".into(),
            ));
        }
        if req.name.trim().is_empty() {
            return Err(Error::InvalidInput("server name must not be empty".into()));
        }

        let mut st = self.inner.state.lock().await;
        let port = self.inner.allocate_port(&st, req.requested_port)?;
        let record = ToolServerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name,
            instructions: req.instructions,
            port,
            enabled: false,
            kind: kind_for(&req.kb_ids),
            kb_ids: req.kb_ids,
            tool_descriptions: req.tool_descriptions,
            tool_param_descriptions: req.tool_param_descriptions,
            status: ServerStatus::Stopped,
            last_error: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        st.records.push(record.clone());
        save_records(&self.inner.root, &st.records)?;
        tracing::info!(server = %record.id, port, "tool server created");
        Ok(record)
    }

    /// Start a server and wait until its health endpoint answers.
    pub async fn start(&self, id: &str) -> Result<ToolServerRecord> {
        self.inner.ensure_writable()?;
        {
            let mut st = self.inner.state.lock().await;
            let rec = find_mut(&mut st.records, id)?;
            if rec.status == ServerStatus::Running {
                return Ok(rec.clone());
            }
            rec.enabled = true;
            save_records(&self.inner.root, &st.records)?;
        }
        self.inner.clone().do_start(id).await?;
        self.get(id).await
    }

    /// Stop a server: graceful shutdown request, bounded wait, then kill.
    pub async fn stop(&self, id: &str) -> Result<ToolServerRecord> {
        self.inner.ensure_writable()?;
        let (port, had_child, was_active) = {
            let mut st = self.inner.state.lock().await;
            let had_child = st.children.contains_key(id);
            let rec = find_mut(&mut st.records, id)?;
            let was_active =
                matches!(rec.status, ServerStatus::Running | ServerStatus::Starting);
            rec.enabled = false;
            st.stopping.insert(id.to_string());
            let port = find_mut(&mut st.records, id)?.port;
            (port, had_child, was_active)
        };

        if was_active {
            request_shutdown(port).await;
        }

        if had_child {
            let exited = self.inner.wait_child_gone(id, STOP_TIMEOUT).await;
            if !exited {
                tracing::warn!(server = %id, "graceful stop timed out, killing");
                if let Some(handle) = self.inner.state.lock().await.children.remove(id) {
                    handle.kill_tx.send(()).ok();
                }
                self.inner.wait_child_gone(id, Duration::from_secs(2)).await;
            }
        } else if was_active {
            // Child spawned by a previous supervisor process: no handle to
            // kill, so wait for the port to come free after the shutdown
            // request.
            let deadline = Instant::now() + STOP_TIMEOUT;
            while !port_is_free(port) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let mut st = self.inner.state.lock().await;
        st.stopping.remove(id);
        st.restarts.remove(id);
        let rec = find_mut(&mut st.records, id)?;
        rec.status = ServerStatus::Stopped;
        rec.last_error = None;
        let rec = rec.clone();
        save_records(&self.inner.root, &st.records)?;
        tracing::info!(server = %id, "tool server stopped");
        Ok(rec)
    }

    /// Apply field updates. A running server whose serving surface
    /// changed is restarted on the same port.
    pub async fn update(&self, id: &str, upd: ServerUpdate) -> Result<ToolServerRecord> {
        self.inner.ensure_writable()?;
        if let Some(kb_ids) = &upd.kb_ids {
            if kb_ids.is_empty() {
                return Err(Error::InvalidInput(
                    "a tool server needs at least one knowledge base".into(),
                ));
            }
        }
        let needs_restart = {
            let mut st = self.inner.state.lock().await;
            let rec = find_mut(&mut st.records, id)?;
            let was_running = rec.status == ServerStatus::Running;

            if let Some(name) = &upd.name {
                rec.name = name.clone();
            }
            if let Some(instructions) = &upd.instructions {
                rec.instructions = instructions.clone();
            }
            if let Some(kb_ids) = &upd.kb_ids {
                rec.kb_ids = kb_ids.clone();
                rec.kind = kind_for(kb_ids);
            }
            if let Some(descs) = &upd.tool_descriptions {
                rec.tool_descriptions = descs.clone();
            }
            if let Some(params) = &upd.tool_param_descriptions {
                rec.tool_param_descriptions = params.clone();
            }
            save_records(&self.inner.root, &st.records)?;
            was_running && upd.affects_serving()
        };

        if needs_restart {
            tracing::info!(server = %id, "restarting to apply configuration");
            self.restart(id).await?;
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.inner.ensure_writable()?;
        // Missing records error out of stop; a stopped record passes.
        self.stop(id).await?;
        let mut st = self.inner.state.lock().await;
        st.records.retain(|r| r.id != id);
        save_records(&self.inner.root, &st.records)?;
        tracing::info!(server = %id, "tool server deleted");
        Ok(())
    }

    /// Stop-then-start keeping the port.
    pub async fn restart(&self, id: &str) -> Result<()> {
        self.stop(id).await?;
        self.start(id).await?;
        Ok(())
    }

    /// Start every record that is marked enabled. Used at service
    /// startup; failures are recorded per server, not propagated.
    pub async fn start_enabled(&self) {
        let ids: Vec<String> = {
            let st = self.inner.state.lock().await;
            st.records
                .iter()
                .filter(|r| r.enabled && r.status != ServerStatus::Running)
                .map(|r| r.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.start(&id).await {
                tracing::error!(server = %id, error = %e, "failed to start enabled tool server");
            }
        }
    }

    /// Stop every running child. Called on orderly shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let st = self.inner.state.lock().await;
            st.children.keys().cloned().collect()
        };
        for id in ids {
            self.stop(&id).await.ok();
        }
    }

    // ── KB lifecycle events ──────────────────────────────────────────────

    /// A new KB gets a default single-KB server, stopped and disabled.
    pub async fn on_kb_created(&self, kb_id: &str, kb_name: &str) {
        if self.inner.read_only {
            return;
        }
        let req = CreateServer {
            name: format!("{} - default", kb_name),
            instructions: String::new(),
            kb_ids: vec![kb_id.to_string()],
            tool_descriptions: HashMap::new(),
            tool_param_descriptions: HashMap::new(),
            requested_port: None,
        };
        if let Err(e) = self.create(req).await {
            tracing::warn!(kb = %kb_id, error = %e, "could not create default tool server");
        }
    }

    /// Rename ripples into default-server names and restarts running
    /// servers so announced metadata stays current.
    pub async fn on_kb_renamed(&self, kb_id: &str, old_name: &str, new_name: &str) -> Result<()> {
        let affected: Vec<String> = {
            let mut st = self.inner.state.lock().await;
            let default_name = format!("{} - default", old_name);
            let mut affected = Vec::new();
            for rec in st.records.iter_mut() {
                if !rec.kb_ids.iter().any(|k| k == kb_id) {
                    continue;
                }
                if rec.name == default_name {
                    rec.name = format!("{} - default", new_name);
                }
                if rec.status == ServerStatus::Running {
                    affected.push(rec.id.clone());
                }
            }
            save_records(&self.inner.root, &st.records)?;
            affected
        };

        for id in affected {
            self.restart(&id).await?;
        }
        Ok(())
    }

    /// Drop the KB from every record; servers left with no KBs are
    /// deleted, the rest restart if running.
    pub async fn on_kb_deleted(&self, kb_id: &str) -> Result<()> {
        let (doomed, affected) = {
            let mut st = self.inner.state.lock().await;
            let mut doomed = Vec::new();
            let mut affected = Vec::new();
            for rec in st.records.iter_mut() {
                if !rec.kb_ids.iter().any(|k| k == kb_id) {
                    continue;
                }
                rec.kb_ids.retain(|k| k != kb_id);
                if rec.kb_ids.is_empty() {
                    doomed.push(rec.id.clone());
                } else {
                    rec.kind = kind_for(&rec.kb_ids);
                    if rec.status == ServerStatus::Running {
                        affected.push(rec.id.clone());
                    }
                }
            }
            save_records(&self.inner.root, &st.records)?;
            (doomed, affected)
        };

        for id in doomed {
            self.delete(&id).await?;
        }
        for id in affected {
            self.restart(&id).await?;
        }
        Ok(())
    }
}

impl Inner {
    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Internal(
                "supervisor is read-only in this process".into(),
            ));
        }
        Ok(())
    }

    /// Honor a requested port when free; otherwise walk the range.
    /// "Free" means unclaimed by any record and currently bindable.
    fn allocate_port(&self, st: &SupState, requested: Option<u16>) -> Result<u16> {
        let used: HashSet<u16> = st.records.iter().map(|r| r.port).collect();

        if let Some(p) = requested {
            if (self.start_port..=self.max_port).contains(&p)
                && !used.contains(&p)
                && port_is_free(p)
            {
                return Ok(p);
            }
        }

        for p in self.start_port..=self.max_port {
            if !used.contains(&p) && port_is_free(p) {
                return Ok(p);
            }
        }
        Err(Error::PortUnavailable(format!(
            "no free port in [{}, {}]",
            self.start_port, self.max_port
        )))
    }

    async fn wait_child_gone(&self, id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.state.lock().await.children.contains_key(id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        !self.state.lock().await.children.contains_key(id)
    }

    /// Spawn the child, monitor it, and wait for health.
    fn do_start<'a>(
        self: Arc<Self>,
        id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.do_start_inner(id))
    }

    async fn do_start_inner(self: Arc<Self>, id: &str) -> Result<()> {
        let port = {
            let mut st = self.state.lock().await;
            let rec = find_mut(&mut st.records, id)?;
            rec.status = ServerStatus::Starting;
            rec.last_error = None;
            let port = rec.port;
            save_records(&self.root, &st.records)?;
            port
        };

        let result = self.clone().spawn_and_wait_healthy(id, port).await;
        match result {
            Ok(()) => {
                let mut st = self.state.lock().await;
                let rec = find_mut(&mut st.records, id)?;
                rec.status = ServerStatus::Running;
                save_records(&self.root, &st.records)?;
                tracing::info!(server = %id, port, "tool server running");
                Ok(())
            }
            Err(e) => {
                // Tear down whatever half-started. The stopping mark goes
                // in before the kill so the monitor doesn't count this
                // exit as a crash to auto-restart.
                let handle = {
                    let mut st = self.state.lock().await;
                    st.stopping.insert(id.to_string());
                    let handle = st.children.remove(id);
                    let rec = find_mut(&mut st.records, id)?;
                    rec.status = ServerStatus::Crashed;
                    rec.last_error = Some(e.to_string());
                    save_records(&self.root, &st.records)?;
                    handle
                };
                if let Some(handle) = handle {
                    handle.kill_tx.send(()).ok();
                }
                tracing::error!(server = %id, error = %e, "tool server failed to start");
                Err(e)
            }
        }
    }

    async fn spawn_and_wait_healthy(self: Arc<Self>, id: &str, port: u16) -> Result<()> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::SubprocessFailed(format!("resolving binary: {}", e)))?;

        let mut child = tokio::process::Command::new(exe)
            .arg("toolserve")
            .arg("--root")
            .arg(&self.root)
            .arg("--server-id")
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::SubprocessFailed(format!("spawn: {}", e)))?;

        let (kill_tx, kill_rx) = tokio::sync::oneshot::channel::<()>();
        {
            let mut st = self.state.lock().await;
            // A leftover stopping mark from an earlier failed start must
            // not swallow this child's first real crash.
            st.stopping.remove(id);
            st.children.insert(id.to_string(), ChildHandle { kill_tx });
        }

        let monitor = self.clone();
        let monitor_id = id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    child.kill().await.ok();
                    child.wait().await
                }
            };
            monitor.on_child_exit(&monitor_id, status.ok()).await;
        });

        // The child owns the bind; we poll its health endpoint.
        let url = format!("http://127.0.0.1:{}/health", port);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if !self.state.lock().await.children.contains_key(id) {
                return Err(Error::SubprocessFailed(
                    "tool server exited before becoming healthy".into(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "tool server did not become healthy within {:?}",
                    START_TIMEOUT
                )));
            }
        }
    }

    /// Monitor-task callback. Exit 0 or an intentional stop is
    /// `stopped`; anything else is `crashed` with bounded auto-restart.
    async fn on_child_exit(self: Arc<Self>, id: &str, status: Option<std::process::ExitStatus>) {
        let restart = {
            let mut st = self.state.lock().await;
            st.children.remove(id);
            let intentional = st.stopping.remove(id);

            let Some(rec) = st.records.iter_mut().find(|r| r.id == id) else {
                return;
            };
            let code = status.and_then(|s| s.code());

            if intentional || code == Some(0) {
                // A failed start records `crashed` itself and kills the
                // child; don't downgrade that to `stopped` here.
                if rec.status != ServerStatus::Crashed {
                    rec.status = ServerStatus::Stopped;
                }
                save_records(&self.root, &st.records).ok();
                false
            } else {
                let reason = match code {
                    Some(c) => format!("exited with code {}", c),
                    None => "terminated by signal".to_string(),
                };
                rec.status = ServerStatus::Crashed;
                rec.last_error = Some(reason.clone());
                let enabled = rec.enabled;
                save_records(&self.root, &st.records).ok();
                tracing::error!(server = %id, %reason, "tool server crashed");

                let now = Instant::now();
                let attempts = st.restarts.entry(id.to_string()).or_default();
                attempts.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
                if enabled && attempts.len() < MAX_RESTARTS {
                    attempts.push(now);
                    true
                } else {
                    if enabled {
                        tracing::error!(server = %id, "restart budget exhausted, staying crashed");
                    }
                    false
                }
            }
        };

        if restart {
            tracing::info!(server = %id, "attempting automatic restart");
            let inner = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                inner.do_start(&id).await.ok();
            });
        }
    }
}

fn kind_for(kb_ids: &[String]) -> ServerKind {
    if kb_ids.len() == 1 {
        ServerKind::Single
    } else {
        ServerKind::Multi
    }
}

fn find_mut<'a>(
    records: &'a mut [ToolServerRecord],
    id: &str,
) -> Result<&'a mut ToolServerRecord> {
    records
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| Error::NotFound(format!("tool server {}", id)))
}

/// Atomic write via temp file + rename.
fn save_records(root: &Path, records: &[ToolServerRecord]) -> Result<()> {
    let path = config::servers_path(root);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Best-effort graceful shutdown request to a child.
async fn request_shutdown(port: u16) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(c) => c,
        Err(_) => return,
    };
    let url = format!("http://127.0.0.1:{}/shutdown", port);
    client.post(&url).send().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_config(start: u16, max: u16) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.mcp.start_port = start;
        cfg.mcp.max_port = max;
        cfg
    }

    fn req(name: &str, kb: &str) -> CreateServer {
        CreateServer {
            name: name.to_string(),
            instructions: String::new(),
            kb_ids: vec![kb.to_string()],
            tool_descriptions: HashMap::new(),
            tool_param_descriptions: HashMap::new(),
            requested_port: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_distinct_ports_in_range() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18100, 18110), false).unwrap();

        let a = sup.create(req("a", "kb1")).await.unwrap();
        let b = sup.create(req("b", "kb2")).await.unwrap();
        assert_ne!(a.port, b.port);
        assert!((18100..=18110).contains(&a.port));
        assert_eq!(a.status, ServerStatus::Stopped);
        assert!(!a.enabled);
        assert_eq!(a.kind, ServerKind::Single);
    }

    #[tokio::test]
    async fn requested_port_honored_when_free() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18120, 18130), false).unwrap();

        let mut r = req("a", "kb1");
        r.requested_port = Some(18125);
        let rec = sup.create(r).await.unwrap();
        assert_eq!(rec.port, 18125);

        // Same request again falls through to the first free port.
        let mut r2 = req("b", "kb2");
        r2.requested_port = Some(18125);
        let rec2 = sup.create(r2).await.unwrap();
        assert_ne!(rec2.port, 18125);
    }

    #[tokio::test]
    async fn exhausted_range_reports_no_ports() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18140, 18141), false).unwrap();

        sup.create(req("a", "kb1")).await.unwrap();
        sup.create(req("b", "kb2")).await.unwrap();
        let err = sup.create(req("c", "kb3")).await.unwrap_err();
        assert_eq!(err.kind(), "port_unavailable");
    }

    #[tokio::test]
    async fn records_persist_across_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = app_config(18150, 18160);
        let id = {
            let sup = Supervisor::load(tmp.path(), &cfg, false).unwrap();
            sup.create(req("persisted", "kb1")).await.unwrap().id
        };
        let sup = Supervisor::load(tmp.path(), &cfg, false).unwrap();
        let rec = sup.get(&id).await.unwrap();
        assert_eq!(rec.name, "persisted");
    }

    #[tokio::test]
    async fn stale_running_status_is_reconciled_at_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = app_config(18170, 18180);
        let id = {
            let sup = Supervisor::load(tmp.path(), &cfg, false).unwrap();
            let rec = sup.create(req("ghost", "kb1")).await.unwrap();
            // Forge a running status as a crashed supervisor would leave.
            let mut st = sup.inner.state.lock().await;
            find_mut(&mut st.records, &rec.id).unwrap().status = ServerStatus::Running;
            save_records(tmp.path(), &st.records).unwrap();
            rec.id
        };
        let sup = Supervisor::load(tmp.path(), &cfg, false).unwrap();
        assert_eq!(sup.get(&id).await.unwrap().status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn kb_deletion_prunes_and_deletes_servers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18190, 18199), false).unwrap();

        let single = sup.create(req("single", "kb1")).await.unwrap();
        let mut multi_req = req("multi", "kb1");
        multi_req.kb_ids.push("kb2".to_string());
        let multi = sup.create(multi_req).await.unwrap();
        assert_eq!(multi.kind, ServerKind::Multi);

        sup.on_kb_deleted("kb1").await.unwrap();

        assert!(sup.get(&single.id).await.is_err());
        let multi = sup.get(&multi.id).await.unwrap();
        assert_eq!(multi.kb_ids, vec!["kb2".to_string()]);
        assert_eq!(multi.kind, ServerKind::Single);
    }

    #[tokio::test]
    async fn rename_updates_default_server_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18200, 18210), false).unwrap();

        sup.on_kb_created("kb1", "notes").await;
        sup.on_kb_renamed("kb1", "notes", "journal").await.unwrap();

        let names: Vec<String> = sup.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["journal - default".to_string()]);
    }

    #[tokio::test]
    async fn update_rejects_empty_kb_set() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18220, 18230), false).unwrap();
        let rec = sup.create(req("a", "kb1")).await.unwrap();

        let upd = ServerUpdate {
            kb_ids: Some(vec![]),
            ..Default::default()
        };
        assert!(sup.update(&rec.id, upd).await.is_err());
    }

    #[tokio::test]
    async fn stop_on_stopped_record_is_a_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(tmp.path(), &app_config(18240, 18250), false).unwrap();
        let rec = sup.create(req("a", "kb1")).await.unwrap();
        let rec = sup.stop(&rec.id).await.unwrap();
        assert_eq!(rec.status, ServerStatus::Stopped);
    }
}
