use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docsync"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("policies")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nTravel expenses are reimbursed within thirty days.",
    )
    .unwrap();
    fs::write(
        files_dir.join("policies/beta.txt"),
        "Remote work policy.\n\nEmployees may work remotely two days a week.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Security notes.\x0CSecond page about badge access.\x0CThird page.",
    )
    .unwrap();
    fs::write(files_dir.join("ignored.bin"), [0u8, 1, 2, 3]).unwrap();

    let config_content = format!(
        r#"[index]
backend = "sqlite"
path = "{root}/data/docsync.sqlite"

[source]
kind = "filesystem"
name = "handbook"
allowed_formats = ["md", "txt", "pdf"]

[source.filesystem]
root = "{root}/files"

[sync]
concurrency = 2

[transform]
default = []
txt = [{{ operation = "max_pages", parameters = {{ num_max_pages = 1 }} }}]
pdf = [
  {{ operation = "max_pages", parameters = {{ num_max_pages = 5 }} }},
  {{ operation = "watermark" }},
]

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("DOCSYNC_SOURCE_ENABLED")
        .env_remove("DOCSYNC_ALLOWED_FORMATS")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn sync(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_docsync(config_path, &["sync", "--progress", "off"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

/// Value of a `  key: value` summary line.
fn field<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix(&format!("{}:", key)))
        .map(str::trim)
        .unwrap_or_else(|| panic!("no '{}' line in:\n{}", key, stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docsync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docsync.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_docsync(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_docsync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sync_indexes_allowed_files() {
    let (_tmp, config_path) = setup_test_env();

    let stdout = sync(&config_path);
    assert!(stdout.contains("sync filesystem:handbook"));
    assert_eq!(field(&stdout, "state"), "done");
    assert_eq!(field(&stdout, "listed"), "3");
    assert_eq!(field(&stdout, "succeeded"), "3 (0 unchanged)");
    assert_eq!(field(&stdout, "failed"), "0");
}

#[test]
fn test_sync_idempotent_no_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    sync(&config_path);
    let stdout = sync(&config_path);
    assert_eq!(field(&stdout, "succeeded"), "3 (3 unchanged)");
    assert_eq!(field(&stdout, "purged"), "0 (0 failed)");

    let (stats, _, success) = run_docsync(&config_path, &["stats"]);
    assert!(success);
    assert_eq!(field(&stats, "Documents"), "3");
}

#[test]
fn test_sync_writes_json_summary() {
    let (tmp, config_path) = setup_test_env();
    let summary_path = tmp.path().join("data/runs/last.json");

    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &["sync", "--progress", "off", "--summary", summary_path.to_str().unwrap()],
    );
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(field(&stdout, "excluded"), "1");

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(json["scope"], "filesystem:handbook");
    assert_eq!(json["state"], "done");
    assert_eq!(json["listed"], 3);
    assert_eq!(json["excluded"], 1);
    assert_eq!(json["succeeded"], 3);
    assert!(json["run_id"].as_str().is_some());
}

#[test]
fn test_sync_full_reprocesses_everything() {
    let (_tmp, config_path) = setup_test_env();

    sync(&config_path);
    let (stdout, stderr, success) =
        run_docsync(&config_path, &["sync", "--full", "--progress", "off"]);
    assert!(success, "full sync failed: {}", stderr);
    assert_eq!(field(&stdout, "succeeded"), "3 (0 unchanged)");
}

#[test]
fn test_removed_file_is_purged() {
    let (tmp, config_path) = setup_test_env();

    sync(&config_path);
    fs::remove_file(tmp.path().join("files/policies/beta.txt")).unwrap();

    let stdout = sync(&config_path);
    assert_eq!(field(&stdout, "listed"), "2");
    assert_eq!(field(&stdout, "purged"), "1 (0 failed)");

    let (stats, _, _) = run_docsync(&config_path, &["stats"]);
    assert_eq!(field(&stats, "Documents"), "2");
    assert!(stats.contains("filesystem:handbook"));
}

#[test]
fn test_sync_dry_run_writes_nothing() {
    let (tmp, config_path) = setup_test_env();

    sync(&config_path);
    fs::remove_file(tmp.path().join("files/alpha.md")).unwrap();
    fs::write(tmp.path().join("files/delta.md"), "# Delta").unwrap();

    let (stdout, stderr, success) =
        run_docsync(&config_path, &["sync", "--dry-run", "--progress", "off"]);
    assert!(success, "dry run failed: {}", stderr);
    assert!(stdout.contains("(dry-run)"));
    assert_eq!(field(&stdout, "would process"), "1");
    assert_eq!(field(&stdout, "unchanged"), "2");
    assert_eq!(field(&stdout, "would purge"), "1");

    let (stats, _, _) = run_docsync(&config_path, &["stats"]);
    assert_eq!(field(&stats, "Documents"), "3");
}

#[test]
fn test_no_purge_keeps_entries() {
    let (tmp, config_path) = setup_test_env();

    sync(&config_path);
    fs::remove_file(tmp.path().join("files/alpha.md")).unwrap();
    let (stdout, _, success) =
        run_docsync(&config_path, &["sync", "--no-purge", "--progress", "off"]);
    assert!(success);
    assert_eq!(field(&stdout, "purged"), "0 (0 failed)");

    let (stats, _, _) = run_docsync(&config_path, &["stats"]);
    assert_eq!(field(&stats, "Documents"), "3");
}

#[test]
fn test_rules_shows_resolved_chain() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_docsync(&config_path, &["rules", ".PDF"]);
    assert!(success);
    assert!(stdout.contains("rules for .pdf (from pdf)"));
    assert!(stdout.contains("1. max_pages"));
    assert!(stdout.contains("num_max_pages"));
    assert!(stdout.contains("2. watermark"));
    assert!(stdout.contains("unknown, will be skipped"));

    let (stdout, _, success) = run_docsync(&config_path, &["rules", "docx"]);
    assert!(success);
    assert!(stdout.contains("(from none)"));
}

#[test]
fn test_sources() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docsync(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("filesystem:handbook"));
    assert!(stdout.contains("OK"));
    assert!(stdout.contains("relocation destination: none"));
}

#[test]
fn test_missing_source_root_fails_sync() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_dir_all(tmp.path().join("files")).unwrap();

    let (stdout, _, success) = run_docsync(&config_path, &["sync", "--progress", "off"]);
    assert!(!success);
    assert_eq!(field(&stdout, "state"), "failed");

    let (stdout, _, success) = run_docsync(&config_path, &["sources"]);
    assert!(!success);
    assert!(stdout.contains("ERROR"));
}

#[test]
fn test_disabled_source_is_a_no_op() {
    let (_tmp, config_path) = setup_test_env();

    let output = Command::new(docsync_binary())
        .arg("--config")
        .arg(&config_path)
        .args(["sync", "--progress", "off"])
        .env("DOCSYNC_SOURCE_ENABLED", "false")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(output.status.success());
    assert_eq!(field(&stdout, "state"), "done");
    assert_eq!(field(&stdout, "listed"), "0");
}

#[test]
fn test_invalid_config_exits_with_error() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[index]\nbackend = \"sqlite\"\n\n[sync]\nconcurrency = 0\n").unwrap();

    let (_, stderr, success) = run_docsync(&bad, &["sync"]);
    assert!(!success);
    assert!(stderr.contains("configuration error"), "stderr: {}", stderr);

    let (_, stderr, success) = run_docsync(&tmp.path().join("config/missing.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("failed to read config file"));
}

#[test]
fn test_unknown_progress_mode_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_docsync(&config_path, &["sync", "--progress", "loud"]);
    assert!(!success);
    assert!(stderr.contains("unknown progress mode"));
}
