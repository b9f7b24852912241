use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ndvi_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ndvi"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ndvi.sqlite"

[catalog]
# Nothing listens here; commands under test never reach the catalog.
url = "http://127.0.0.1:9/stac"
sign_assets = false

[fetch]
max_dimension = 256
max_retries = 1

[analysis]
max_cloud_cover = 15.0
selection_mode = "quality"

[server]
bind = "127.0.0.1:0"
"#,
        root.display()
    );

    let config_path = config_dir.join("ndvi.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ndvi(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ndvi_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ndvi binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ndvi(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully"));
    assert!(tmp.path().join("data/ndvi.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ndvi(&config_path, &["init"]);
    assert!(success, "first init failed: {}", stderr);
    let (_, stderr, success) = run_ndvi(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_list_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_ndvi(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ndvi(&config_path, &["list"]);
    assert!(success, "list failed: {}", stderr);
    assert!(stdout.contains("No analyses."));
}

#[test]
fn test_get_missing_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_ndvi(&config_path, &["init"]);

    let (_, stderr, success) = run_ndvi(&config_path, &["get", "ndvi_000000000000"]);
    assert!(!success);
    assert!(stderr.contains("analysis not found"));
}

#[test]
fn test_export_missing_fails() {
    let (tmp, config_path) = setup_test_env();
    run_ndvi(&config_path, &["init"]);

    let out = tmp.path().join("out/diff.png");
    let (_, stderr, success) = run_ndvi(
        &config_path,
        &["export", "ndvi_000000000000", "difference", "--out", out.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("analysis not found"));
    assert!(!out.exists());
}

#[test]
fn test_export_rejects_unknown_kind() {
    let (tmp, config_path) = setup_test_env();
    let out = tmp.path().join("x.png");

    let (_, stderr, success) = run_ndvi(
        &config_path,
        &["export", "ndvi_000000000000", "composite", "--out", out.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("invalid image type"));
}

#[test]
fn test_areas_lists_presets_without_config() {
    let (stdout, stderr, success) = run_ndvi(Path::new("/nonexistent/ndvi.toml"), &["areas"]);
    assert!(success, "areas failed: {}", stderr);
    assert!(stdout.contains("gurgaon_south_delhi"));
    assert!(stdout.contains("(default)"));
    assert!(stdout.contains("pune_hinjewadi"));
}

#[test]
fn test_analyze_rejects_bad_input_before_network() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ndvi(
        &config_path,
        &["analyze", "--area", "atlantis", "--start", "2023-01-01", "--end", "2024-01-01"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown area"));

    let (_, stderr, success) = run_ndvi(
        &config_path,
        &["analyze", "--bbox", "10,10,5,20", "--start", "2023-01-01", "--end", "2024-01-01"],
    );
    assert!(!success);
    assert!(stderr.contains("invalid bbox"));

    let (_, _, success) = run_ndvi(
        &config_path,
        &["analyze", "--start", "2024-01-01", "--end", "2023-01-01"],
    );
    assert!(!success);
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, success) = run_ndvi(Path::new("/nonexistent/ndvi.toml"), &["list"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
