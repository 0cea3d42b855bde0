use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn vsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vsync"))
}

fn setup_test_env(endpoint: &str, extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let vault = root.join("vault");
    fs::create_dir_all(vault.join("notes")).unwrap();
    fs::create_dir_all(vault.join(".obsidian")).unwrap();
    fs::write(
        vault.join("alpha.md"),
        "---\ntags: [rust]\n---\n# Alpha\n\nThe alpha note talks about cargo and crates.",
    )
    .unwrap();
    fs::write(
        vault.join("notes/beta.md"),
        "# Beta\n\nBeta covers deployment.\n\n## Details\n\nKubernetes and Docker.",
    )
    .unwrap();
    fs::write(vault.join("gamma.txt"), "Gamma plain text notes.").unwrap();
    fs::write(vault.join(".obsidian/workspace.md"), "ignored").unwrap();

    let config_content = format!(
        r#"[vault]
root = "{root}/vault"
include_globs = ["**/*.md", "**/*.txt"]

[state]
dir = "{root}/data"

[sync]
batch_size = 2
inter_batch_delay_ms = 0
stop_grace_ms = 0
{extra}

[chroma]
endpoint = "{endpoint}"
collection = "vault"
token_env = "VSYNC_TEST_UNSET_TOKEN"
max_retries = 0
"#,
        root = root.display(),
        endpoint = endpoint,
        extra = extra,
    );

    let config_path = config_dir.join("vsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = vsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_status_before_first_sync() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9", "");
    let (stdout, stderr, ok) = run_vsync(&config, &["status"]);
    assert!(ok, "status failed: {}", stderr);
    assert!(stdout.contains("No sync recorded yet."));
    assert!(stdout.contains("Verification: never"));
}

#[test]
fn test_dry_run_lists_plan_without_recording() {
    let (tmp, config) = setup_test_env("http://127.0.0.1:9", "");
    let (stdout, stderr, ok) = run_vsync(&config, &["sync", "--dry-run", "--progress", "off"]);
    assert!(ok, "dry run failed: {}", stderr);
    assert!(stdout.contains("sync (dry run)"));
    assert!(stdout.contains("upsert alpha.md"));
    assert!(stdout.contains("upsert notes/beta.md"));
    assert!(stdout.contains("added: 3"));
    assert!(!stdout.contains("workspace.md"));
    assert!(!tmp.path().join("data/file_state.json").exists());
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9", "success_threshold = 1.5");
    let (_stdout, stderr, ok) = run_vsync(&config, &["status"]);
    assert!(!ok);
    assert!(stderr.contains("success_threshold"));
}

#[test]
fn test_unknown_progress_mode_is_rejected() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9", "");
    let (_stdout, stderr, ok) = run_vsync(&config, &["sync", "--dry-run", "--progress", "loud"]);
    assert!(!ok);
    assert!(stderr.contains("Unknown progress mode"));
}

#[test]
fn test_stop_without_session() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9", "");
    let (stdout, _stderr, ok) = run_vsync(&config, &["stop"]);
    assert!(ok);
    assert!(stdout.contains("No active sync session."));
}

#[test]
fn test_chunk_small_file() {
    let (tmp, config) = setup_test_env("http://127.0.0.1:9", "");
    let file = tmp.path().join("vault/notes/beta.md");
    let (stdout, stderr, ok) = run_vsync(&config, &["chunk", file.to_str().unwrap()]);
    assert!(ok, "chunk failed: {}", stderr);
    assert!(stdout.contains("fits in a single record"));
}

#[test]
fn test_chunk_large_file_prints_plan() {
    let (tmp, config) = setup_test_env("http://127.0.0.1:9", "");
    let mut body = String::from("# Big\n\n");
    for i in 0..2000 {
        body.push_str(&format!("Sentence number {} about the vault. ", i));
        if i % 20 == 19 {
            body.push_str("\n\n");
        }
    }
    let file = tmp.path().join("vault/big.md");
    fs::write(&file, body).unwrap();

    let (stdout, stderr, ok) = run_vsync(&config, &["chunk", file.to_str().unwrap()]);
    assert!(ok, "chunk failed: {}", stderr);
    assert!(stdout.contains("[0]"));
    assert!(stdout.contains("[1]"));
    assert!(stdout.contains("Big"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_against_mock_chroma_then_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(
            "/api/v2/tenants/default_tenant/databases/default_database/collections",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "col-1" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/collections/col-1/(upsert|delete)$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let (tmp, config) = setup_test_env(&server.uri(), "verify_after_sync = false");
    let config_sync = config.clone();
    let (stdout, stderr, ok) = tokio::task::spawn_blocking(move || {
        run_vsync(&config_sync, &["sync", "--progress", "off"])
    })
    .await
    .unwrap();
    assert!(ok, "sync failed: {}", stderr);
    assert!(stdout.contains("sync (success)"));
    assert!(stdout.contains("processed: 3 / 3"));
    assert!(tmp.path().join("data/file_state.json").exists());
    assert!(!tmp.path().join("data/sync_session.json").exists());

    let (stdout, _stderr, ok) =
        tokio::task::spawn_blocking(move || run_vsync(&config, &["status"]))
            .await
            .unwrap();
    assert!(ok);
    assert!(stdout.contains("Documents:   3"));
}
