//! End-to-end tests: engine scenarios through the library API, and
//! tool-server lifecycle through the real binary (the supervisor spawns
//! children from the same executable, so those flows must go through the
//! CLI).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use docbase::engine::Engine;
use docbase::models::{DocStatus, KbConfig};

const FOX: &[u8] = b"The quick brown fox jumps over the lazy dog.";

// ── Library-level scenarios ─────────────────────────────────────────────

#[tokio::test]
async fn upload_then_query_returns_the_passage() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    let doc = engine.upload_document(&kb.id, "hello.txt", FOX).await.unwrap();
    assert_eq!(doc.status, DocStatus::Ready);

    let response = engine.query(&kb.id, "lazy dog", 5).await.unwrap();
    assert_eq!(response.total, 1);
    assert!(response.elapsed_seconds <= 2.0);

    let hit = &response.results[0];
    assert_eq!(hit.filename, "hello.txt");
    assert!(hit.content.contains("lazy dog"));
    assert!(hit.score > 0.5, "score was {}", hit.score);
}

#[tokio::test]
async fn chunk_size_change_reindexes_and_still_answers() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();
    engine.upload_document(&kb.id, "hello.txt", FOX).await.unwrap();

    let mut cfg = kb.config.clone();
    assert_eq!(cfg.chunk_size, 500);
    cfg.chunk_size = 100;
    let needs_reindex = engine.put_config(&kb.id, &cfg).await.unwrap();
    assert!(needs_reindex);

    engine.reindex(&kb.id).await.unwrap();

    let progress = engine.reindex_progress(&kb.id).unwrap();
    assert_eq!(progress.status, "completed");
    assert!((progress.percent - 100.0).abs() < 1e-9);
    assert_eq!(progress.succeeded, 1);

    let stats = engine.stats(&kb.id).await.unwrap();
    assert_eq!(stats.file_count, 1);
    assert!(stats.total_chunks >= 1);
    assert_eq!(stats.generation, 1);

    let response = engine.query(&kb.id, "lazy dog", 5).await.unwrap();
    assert_eq!(response.results[0].filename, "hello.txt");
}

#[tokio::test]
async fn whitespace_only_file_is_ready_and_invisible() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    engine.upload_document(&kb.id, "hello.txt", FOX).await.unwrap();
    let blank = engine
        .upload_document(&kb.id, "blank.txt", &[b' '; 50])
        .await
        .unwrap();
    assert_eq!(blank.status, DocStatus::Ready);
    assert_eq!(blank.chunk_count, 0);

    let response = engine.query(&kb.id, "lazy dog", 10).await.unwrap();
    assert!(!response.results.is_empty());
    for hit in &response.results {
        assert_ne!(hit.filename, "blank.txt");
    }
}

#[tokio::test]
async fn read_your_writes_with_exact_substring() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    engine
        .upload_document(
            &kb.id,
            "manual.txt",
            b"The flux capacitor requires 1.21 gigawatts to operate.",
        )
        .await
        .unwrap();

    let response = engine
        .query(&kb.id, "flux capacitor requires", 5)
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].filename, "manual.txt");
    assert!(response.results[0].score > 0.0);
}

#[tokio::test]
async fn deleted_document_disappears_from_results() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    let doomed = engine
        .upload_document(&kb.id, "doomed.txt", b"unique zanzibar artichoke festival")
        .await
        .unwrap();
    engine
        .upload_document(&kb.id, "kept.txt", b"ordinary text about gardens")
        .await
        .unwrap();

    let before = engine.query(&kb.id, "zanzibar artichoke", 10).await.unwrap();
    assert!(before.results.iter().any(|r| r.filename == "doomed.txt"));

    engine.delete_document(&kb.id, &doomed.id).await.unwrap();

    let after = engine.query(&kb.id, "zanzibar artichoke", 10).await.unwrap();
    assert!(after.results.iter().all(|r| r.filename != "doomed.txt"));

    let stats = engine.stats(&kb.id).await.unwrap();
    assert_eq!(stats.file_count, 1);
}

#[tokio::test]
async fn reprocess_keeps_counts_and_results_equivalent() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    let doc = engine
        .upload_document(
            &kb.id,
            "paper.txt",
            b"Distributed consensus algorithms.\n\nPaxos and Raft differ in leader election.",
        )
        .await
        .unwrap();

    let before = engine.query(&kb.id, "leader election", 5).await.unwrap();
    let redone = engine.reprocess_document(&kb.id, &doc.id).await.unwrap();
    assert_eq!(redone.chunk_count, doc.chunk_count);

    let after = engine.query(&kb.id, "leader election", 5).await.unwrap();
    let texts_before: Vec<&str> = before.results.iter().map(|r| r.content.as_str()).collect();
    let texts_after: Vec<&str> = after.results.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(texts_before, texts_after);
}

#[tokio::test]
async fn survives_engine_restart() {
    let tmp = TempDir::new().unwrap();
    let kb_id = {
        let engine = Engine::open(tmp.path()).await.unwrap();
        let kb = engine.create_kb("kb1", None).await.unwrap();
        engine.upload_document(&kb.id, "hello.txt", FOX).await.unwrap();
        kb.id
    };

    let engine = Engine::open(tmp.path()).await.unwrap();
    let response = engine.query(&kb_id, "lazy dog", 5).await.unwrap();
    assert_eq!(response.results[0].filename, "hello.txt");
}

#[tokio::test]
async fn reindex_skips_document_with_missing_blob() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    let keeper = engine.upload_document(&kb.id, "kept.txt", FOX).await.unwrap();
    let victim = engine
        .upload_document(&kb.id, "lost.txt", b"this blob will vanish")
        .await
        .unwrap();

    let blob = tmp
        .path()
        .join("knowledge-bases")
        .join(&kb.id)
        .join(&victim.stored_path);
    fs::remove_file(blob).unwrap();

    engine.reindex(&kb.id).await.unwrap();

    let progress = engine.reindex_progress(&kb.id).unwrap();
    assert_eq!(progress.succeeded, 1);
    assert_eq!(progress.failed, 1);

    let victim_after = engine.get_document(&kb.id, &victim.id).await.unwrap();
    assert_eq!(victim_after.status, DocStatus::Failed);
    let keeper_after = engine.get_document(&kb.id, &keeper.id).await.unwrap();
    assert_eq!(keeper_after.status, DocStatus::Ready);

    let response = engine.query(&kb.id, "lazy dog", 5).await.unwrap();
    assert_eq!(response.results[0].filename, "kept.txt");
}

#[tokio::test]
async fn find_similar_excludes_the_source_document() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    let source = engine
        .upload_document(&kb.id, "cats.txt", b"Cats are small domesticated felines.")
        .await
        .unwrap();
    engine
        .upload_document(&kb.id, "lions.txt", b"Lions are large wild felines.")
        .await
        .unwrap();
    engine
        .upload_document(&kb.id, "trains.txt", b"Locomotives pull freight across rails.")
        .await
        .unwrap();

    let similar = engine.find_similar(&kb.id, &source.id, 2).await.unwrap();
    assert!(!similar.is_empty());
    for hit in &similar {
        assert_ne!(hit.document_id, source.id);
    }
    assert_eq!(similar[0].filename, "lions.txt");
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();

    let mut cfg = KbConfig::default();
    cfg.hybrid_alpha = 2.0;
    let err = engine.put_config(&kb.id, &cfg).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");

    let err = engine.query("no-such-kb", "anything", 5).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn empty_query_is_invalid_input() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();
    let err = engine.query(&kb.id, "   ", 5).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
}

#[tokio::test]
async fn hybrid_disabled_still_finds_results() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path()).await.unwrap();
    let kb = engine.create_kb("kb1", None).await.unwrap();
    engine.upload_document(&kb.id, "hello.txt", FOX).await.unwrap();

    let mut cfg = engine.get_config(&kb.id).await.unwrap();
    cfg.hybrid_search = false;
    engine.put_config(&kb.id, &cfg).await.unwrap();

    let response = engine.query(&kb.id, "lazy dog", 5).await.unwrap();
    assert_eq!(response.results[0].filename, "hello.txt");
    assert!(response.results[0].score >= 0.0 && response.results[0].score <= 1.0);
}

// ── Tool-server lifecycle through the binary ────────────────────────────

fn docbase_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // test binary name
    path.pop(); // deps/
    path.push("docbase");
    path
}

fn run_docbase(root: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(docbase_binary())
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run docbase: {}", e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

/// Write a config.json with a dedicated MCP port range so parallel tests
/// never contend for ports.
fn setup_root(range: (u16, u16)) -> TempDir {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("config.json"),
        format!(
            r#"{{ "mcp": {{ "start_port": {}, "max_port": {} }} }}"#,
            range.0, range.1
        ),
    )
    .unwrap();
    let (_, stderr, ok) = run_docbase(tmp.path(), &["init"]);
    assert!(ok, "init failed: {}", stderr);
    tmp
}

/// First whitespace-separated token of the first stdout line.
fn first_id(stdout: &str) -> String {
    stdout
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or_default()
        .to_string()
}

fn parse_port(stdout: &str) -> u16 {
    stdout
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("port="))
        .and_then(|p| p.parse().ok())
        .expect("no port in output")
}

fn post_json(url: &str, body: serde_json::Value) -> serde_json::Value {
    let client = reqwest::blocking::Client::new();
    client.post(url).json(&body).send().unwrap().json().unwrap()
}

#[test]
fn multi_kb_server_searches_only_populated_kb() {
    let tmp = setup_root((18300, 18320));
    let root = tmp.path();

    let (out, _, ok) = run_docbase(root, &["kb", "create", "kb1"]);
    assert!(ok);
    let kb1 = first_id(&out);
    let (out, _, ok) = run_docbase(root, &["kb", "create", "kb2"]);
    assert!(ok);
    let kb2 = first_id(&out);

    let file = root.join("hello.txt");
    fs::write(&file, FOX).unwrap();
    let (out, err, ok) = run_docbase(root, &["upload", &kb1, file.to_str().unwrap()]);
    assert!(ok, "upload failed: {} {}", out, err);
    assert!(out.contains("ready"), "unexpected upload output: {}", out);

    let (out, err, ok) = run_docbase(
        root,
        &["server", "create", "agents", "--kb", &kb1, "--kb", &kb2],
    );
    assert!(ok, "server create failed: {} {}", out, err);
    let server_id = first_id(&out);
    let port = parse_port(&out);

    let (out, err, ok) = run_docbase(root, &["server", "start", &server_id]);
    assert!(ok, "server start failed: {} {}", out, err);
    assert!(out.contains("running"), "unexpected start output: {}", out);

    let body = post_json(
        &format!("http://127.0.0.1:{}/tools/search", port),
        serde_json::json!({ "query": "fox" }),
    );
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty(), "expected results from kb1: {}", body);
    for r in results {
        assert_eq!(r["filename"], "hello.txt");
        assert!(r["score"].as_f64().unwrap() > 0.0);
    }

    let (out, err, ok) = run_docbase(root, &["server", "stop", &server_id]);
    assert!(ok, "server stop failed: {} {}", out, err);
    assert!(out.contains("stopped"));

    // Record remains and the port is released.
    let (out, _, _) = run_docbase(root, &["server", "list"]);
    assert!(out.contains(&server_id));
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[test]
fn kb_rename_restarts_server_on_same_port_with_new_name() {
    let tmp = setup_root((18330, 18350));
    let root = tmp.path();

    let (out, _, ok) = run_docbase(root, &["kb", "create", "notes"]);
    assert!(ok);
    let kb_id = first_id(&out);

    let file = root.join("hello.txt");
    fs::write(&file, FOX).unwrap();
    run_docbase(root, &["upload", &kb_id, file.to_str().unwrap()]);

    // KB creation made a default server; find it.
    let (out, _, _) = run_docbase(root, &["server", "list"]);
    let server_id = first_id(&out);
    assert!(out.contains("notes - default"));

    let (out, err, ok) = run_docbase(root, &["server", "start", &server_id]);
    assert!(ok, "start failed: {} {}", out, err);
    let port = parse_port(&out);

    let info = post_json(
        &format!("http://127.0.0.1:{}/tools/info", port),
        serde_json::json!({}),
    );
    assert_eq!(info["name"], "notes");

    // Rename restarts the running server synchronously.
    let (out, err, ok) = run_docbase(root, &["kb", "rename", &kb_id, "journal"]);
    assert!(ok, "rename failed: {} {}", out, err);

    let (out, _, _) = run_docbase(root, &["server", "list"]);
    assert!(out.contains("running"), "server should be running: {}", out);
    assert!(out.contains(&format!("port={}", port)), "port changed: {}", out);
    assert!(out.contains("journal - default"));

    let info = post_json(
        &format!("http://127.0.0.1:{}/tools/info", port),
        serde_json::json!({}),
    );
    assert_eq!(info["name"], "journal");

    run_docbase(root, &["server", "stop", &server_id]);
}

#[test]
fn deleting_last_kb_removes_its_default_server() {
    let tmp = setup_root((18360, 18380));
    let root = tmp.path();

    let (out, _, _) = run_docbase(root, &["kb", "create", "ephemeral"]);
    let kb_id = first_id(&out);

    let (out, _, _) = run_docbase(root, &["server", "list"]);
    assert!(out.contains("ephemeral - default"));

    let (_, err, ok) = run_docbase(root, &["kb", "delete", &kb_id]);
    assert!(ok, "delete failed: {}", err);

    let (out, _, _) = run_docbase(root, &["server", "list"]);
    assert!(out.trim().is_empty(), "servers should be gone: {}", out);
}

#[test]
fn cli_search_roundtrip() {
    let tmp = setup_root((18390, 18395));
    let root = tmp.path();

    let (out, _, _) = run_docbase(root, &["kb", "create", "kb1"]);
    let kb_id = first_id(&out);

    let file = root.join("hello.txt");
    fs::write(&file, FOX).unwrap();
    run_docbase(root, &["upload", &kb_id, file.to_str().unwrap()]);

    let (out, err, ok) = run_docbase(root, &["search", &kb_id, "lazy dog"]);
    assert!(ok, "search failed: {} {}", out, err);
    assert!(out.contains("hello.txt"), "missing hit: {}", out);

    // Result lines (everything except the timing summary) are stable
    // across runs.
    let results = |s: &str| -> Vec<String> {
        s.lines()
            .filter(|l| !l.contains("results in"))
            .map(|l| l.to_string())
            .collect()
    };
    let (out2, _, _) = run_docbase(root, &["search", &kb_id, "lazy dog"]);
    assert_eq!(results(&out), results(&out2), "search should be deterministic");
}
