#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

const MODULE: &str = "\
module demo

global export limit = 3

export func triple(x) {
    arg x
    const 3
    mul
    ret
}

func hidden() {
    const 0
    ret
}
";

fn write_temp(content: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn orca(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_orca"))
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to execute orca");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_symbols_json() {
    let file = write_temp(MODULE, ".orca");
    let (stdout, stderr, success) = orca(&["symbols", file.path().to_str().unwrap(), "--json"]);
    assert!(success, "stderr:\n{}", stderr);

    let entries: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let entries = entries.as_array().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["limit", "triple"]);
    assert_eq!(entries[0]["kind"], "data");
    assert_eq!(entries[1]["kind"], "function");
    assert!(entries[1]["address"].as_str().unwrap().starts_with("0x"));
}

#[test]
fn test_symbols_table() {
    let file = write_temp(MODULE, ".orca");
    let (stdout, _, success) = orca(&["symbols", file.path().to_str().unwrap()]);
    assert!(success);
    assert_eq!(stdout.lines().count(), 2);
    assert!(stdout.contains("function triple"));
}

#[test]
fn test_run_with_config_file() {
    let module = write_temp(MODULE, ".orca");
    let config = write_temp("compile_workers = 1\nmax_stack = 16\n", ".toml");
    let (stdout, stderr, success) = orca(&[
        "--config",
        config.path().to_str().unwrap(),
        "run",
        module.path().to_str().unwrap(),
        "--entry",
        "triple",
        "14",
    ]);
    assert!(success, "stderr:\n{}", stderr);
    assert_eq!(stdout, "42\n");
}

#[test]
fn test_invalid_config_file() {
    let module = write_temp(MODULE, ".orca");
    let config = write_temp("compile_workers = 0\n", ".toml");
    let (_, stderr, success) = orca(&[
        "--config",
        config.path().to_str().unwrap(),
        "check",
        module.path().to_str().unwrap(),
    ]);
    assert!(!success);
    assert!(stderr.contains("compile_workers must be at least 1"), "stderr:\n{}", stderr);
}

#[test]
fn test_trace_jit_logs_publications() {
    let module = write_temp(MODULE, ".orca");
    let (stdout, stderr, success) = orca(&[
        "--trace-jit",
        "--log-level",
        "info",
        "--workers",
        "2",
        "run",
        module.path().to_str().unwrap(),
        "--entry",
        "triple",
        "-2",
    ]);
    assert!(success, "stderr:\n{}", stderr);
    assert_eq!(stdout, "-6\n");
    assert!(stderr.contains("published symbol"), "stderr:\n{}", stderr);
}

#[test]
fn test_run_internal_entry_is_rejected() {
    let module = write_temp(MODULE, ".orca");
    let (_, stderr, success) = orca(&["run", module.path().to_str().unwrap(), "--entry", "hidden"]);
    assert!(!success);
    assert!(stderr.contains("not exported"));
}

#[test]
fn test_missing_file() {
    let (_, stderr, success) = orca(&["check", "/nonexistent/module.orca"]);
    assert!(!success);
    assert!(stderr.contains("failed to read"));
}
