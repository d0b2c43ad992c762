//! CLI test cases.
//!
//! These run the built binary. Tests that need Poppler or Tesseract on the
//! `PATH` are ignored by default.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("bulk-ocr").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_run_empty_input_dir() {
    let input = TempDir::with_prefix("input").unwrap();
    let output = TempDir::with_prefix("output").unwrap();
    cmd()
        .arg("run")
        .arg(input.path())
        .arg("--output-dir")
        .arg(output.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("No matching documents"));
}

#[test]
fn test_run_writes_log_file() {
    let input = TempDir::with_prefix("input").unwrap();
    let output = TempDir::with_prefix("output").unwrap();
    cmd()
        .arg("run")
        .arg(input.path())
        .arg("--output-dir")
        .arg(output.path())
        .assert()
        .success();
    let logs = std::fs::read_dir(output.path().join("logs"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("run_") && name.ends_with(".log"), "{name}");
    let contents = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(contents.contains("Writing log file"), "{contents}");
}

#[test]
fn test_run_rejects_non_pdf_extension() {
    let input = TempDir::with_prefix("input").unwrap();
    let output = TempDir::with_prefix("output").unwrap();
    cmd()
        .arg("run")
        .arg(input.path())
        .arg("--output-dir")
        .arg(output.path())
        .args(["--extension", "tif"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("only PDF documents"));
}

#[test]
fn test_run_missing_input_dir() {
    let output = TempDir::with_prefix("output").unwrap();
    cmd()
        .arg("run")
        .arg(output.path().join("does-not-exist"))
        .arg("--output-dir")
        .arg(output.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read input directory"));
}

#[test]
fn test_run_rejects_bad_rate_limit() {
    let input = TempDir::with_prefix("input").unwrap();
    cmd()
        .arg("run")
        .arg(input.path())
        .args(["--rate-limit", "lots"])
        .assert()
        .failure();
}

#[test]
fn test_status_fresh_dir() {
    let output = TempDir::with_prefix("output").unwrap();
    cmd()
        .arg("status")
        .arg(output.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No progress recorded"));
}

#[test]
fn test_schema_ledger() {
    cmd()
        .args(["schema", "Ledger"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total_pages_processed"));
}

#[test]
#[ignore = "Needs Poppler and Tesseract installed, and tests/fixtures/scans populated"]
fn test_run_local_scans() {
    let output = TempDir::with_prefix("output").unwrap();
    cmd()
        .arg("run")
        .arg("tests/fixtures/scans")
        .arg("--output-dir")
        .arg(output.path())
        .assert()
        .success();
    cmd()
        .arg("status")
        .arg(output.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Failed:     0 documents"));
}
