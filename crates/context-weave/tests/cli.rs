use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cw_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cw");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let repo = root.join("repo");
    fs::create_dir_all(repo.join("src")).unwrap();
    fs::write(
        repo.join("src/ledger.rs"),
        "/// Posts a transfer between two accounts.\npub fn post_transfer(from: u64, to: u64, cents: i64) -> bool {\n    from != to && cents > 0\n}\n",
    )
    .unwrap();
    fs::write(
        repo.join("GUIDE.md"),
        "# Operations\n\nRestart the ledger service after rotating credentials.\n\n## Backups\n\nSnapshots run nightly.\n",
    )
    .unwrap();
    fs::create_dir_all(repo.join("target")).unwrap();
    fs::write(repo.join("target/junk.rs"), "fn post_transfer() {}\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/cw.sqlite"

[index]
max_tokens = 400

[[index.roots]]
name = "repo"
path = "{root}/repo"
exclude_globs = ["target/**"]

[retrieval]
top_k = 5
"#,
        root = root.display()
    );
    let config_path = config_dir.join("cw.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cw(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(cw_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run cw");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_cw(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/cw.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_cw(&config, &["init"]);
    let (_, stderr, second) = run_cw(&config, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_index_then_reindex_reports_no_changes() {
    let (_tmp, config) = setup_test_env();
    run_cw(&config, &["init"]);

    let (stdout, stderr, success) = run_cw(&config, &["index"]);
    assert!(success, "index failed: {}", stderr);
    assert!(stdout.contains("index repo"));
    assert!(stdout.contains("files scanned: 2"));
    assert!(stdout.contains("added: 2"));

    let (stdout, _, success) = run_cw(&config, &["index"]);
    assert!(success);
    assert!(stdout.contains("added: 0  modified: 0  removed: 0"));
    assert!(stdout.contains("chunks written: 0"));
}

#[test]
fn test_status_after_index() {
    let (_tmp, config) = setup_test_env();
    run_cw(&config, &["init"]);
    run_cw(&config, &["index"]);

    let (stdout, stderr, success) = run_cw(&config, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("context-weave status"));
    assert!(stdout.contains("Files indexed:   2"));
    assert!(!stdout.contains("Last run:        never"));
}

#[test]
fn test_search_finds_indexed_code() {
    let (_tmp, config) = setup_test_env();
    run_cw(&config, &["init"]);
    run_cw(&config, &["index"]);

    let (stdout, stderr, success) = run_cw(&config, &["search", "post_transfer"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("src/ledger.rs"));
    assert!(!stdout.contains("target/junk.rs"));
}

#[test]
fn test_search_json_output() {
    let (_tmp, config) = setup_test_env();
    run_cw(&config, &["init"]);
    run_cw(&config, &["index"]);

    let (stdout, stderr, success) = run_cw(
        &config,
        &["search", "credentials", "--kind", "doc", "--json"],
    );
    assert!(success, "search failed: {}", stderr);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let results = value["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["canonical"]["file_path"], "GUIDE.md");
    assert_eq!(value["degraded"], false);
}

#[test]
fn test_search_rejects_empty_query() {
    let (_tmp, config) = setup_test_env();
    run_cw(&config, &["init"]);
    let (_, stderr, success) = run_cw(&config, &["search", "  "]);
    assert!(!success);
    assert!(stderr.contains("query must not be empty"));
}

#[test]
fn test_sources_lists_roots() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_cw(&config, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("index:repo"));
    assert!(stdout.contains("OK"));
}

#[test]
fn test_embed_pending_requires_provider() {
    let (_tmp, config) = setup_test_env();
    run_cw(&config, &["init"]);
    let (_, _, success) = run_cw(&config, &["embed", "pending"]);
    assert!(!success);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, _, success) = run_cw(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
}
