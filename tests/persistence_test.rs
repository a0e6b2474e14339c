#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::process::Command;
use tempfile::tempdir;

mod common;

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: Final Run of PE-1 creates the payment center
    let mut cmd1 = Command::new(cargo_bin!("payment-process"));
    cmd1.arg("tests/fixtures/claims.csv")
        .arg("--seed")
        .arg("tests/fixtures/seed.json")
        .arg("--mode")
        .arg("final")
        .arg("--db-path")
        .arg(&db_path);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains("\"createdPaymentCenters\": 1"));

    // 2. Second run: a new event over the same payee reuses the stored center
    let seed2 = dir.path().join("seed2.json");
    common::write_seed(&seed2, "PE-2").unwrap();

    let mut cmd2 = Command::new(cargo_bin!("payment-process"));
    cmd2.arg("tests/fixtures/claims.csv")
        .arg("--seed")
        .arg(&seed2)
        .arg("--mode")
        .arg("final")
        .arg("--db-path")
        .arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);

    assert!(stdout2.contains("\"createdPaymentCenters\": 0"));
    assert!(stdout2.contains("\"overall\": 130.0"));
}
