use assert_cmd::cargo_bin;
use std::process::Command;

mod common;

#[test]
fn test_large_claim_file_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let claims = dir.path().join("claims.csv");
    let seed = dir.path().join("seed.json");
    common::generate_claims_csv(&claims, 20_000, 200).expect("Failed to generate claims CSV");
    common::write_seed(&seed, "PE-LARGE").expect("Failed to write seed");

    let output = Command::new(cargo_bin!("payment-process"))
        .arg(&claims)
        .arg("--seed")
        .arg(&seed)
        .arg("--log-level")
        .arg("warn")
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "Binary failed to process 20k claims");

    // 20,000 claims x 2 lines x 10.25
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"overall\": 410000.0"), "{stdout}");
}

#[test]
fn test_large_claim_file_final_run() {
    let dir = tempfile::tempdir().unwrap();
    let claims = dir.path().join("claims.csv");
    let seed = dir.path().join("seed.json");
    common::generate_claims_csv(&claims, 20_000, 200).expect("Failed to generate claims CSV");
    common::write_seed(&seed, "PE-LARGE").expect("Failed to write seed");

    let output = Command::new(cargo_bin!("payment-process"))
        .arg(&claims)
        .arg("--seed")
        .arg(&seed)
        .arg("--mode")
        .arg("final")
        .arg("--batch-size")
        .arg("250")
        .arg("--chunk-size")
        .arg("100")
        .arg("--log-level")
        .arg("warn")
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "Final run failed on 20k claims");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"createdPaymentCenters\": 200"), "{stdout}");
    assert!(stdout.contains("\"overall\": 410000.0"), "{stdout}");
}
