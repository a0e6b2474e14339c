use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

mod common;

#[test]
fn test_malformed_csv_handling() {
    let output_path = std::path::PathBuf::from("robustness_claims.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(common::CLAIM_HEADER).unwrap();

    let row = |claim_id: &str, claim_type: &str, quantity: &str, allowed: &str| {
        vec![
            claim_id.to_string(),
            "P-".to_string() + claim_id,
            String::new(),
            String::new(),
            claim_type.to_string(),
            "Approved".to_string(),
            "1".to_string(),
            common::TAX_ID.to_string(),
            common::NPI.to_string(),
            String::new(),
            "Clinic".to_string(),
            "PLAN-A".to_string(),
            "1".to_string(),
            "99213".to_string(),
            quantity.to_string(),
            allowed.to_string(),
            allowed.to_string(),
        ]
    };

    // Valid claim
    wtr.write_record(row("C1", "Paid", "1", "40.00")).unwrap();
    // Unknown claim type
    wtr.write_record(row("C2", "Refund", "1", "10.00")).unwrap();
    // Text in a money field
    wtr.write_record(row("C3", "Paid", "1", "not_a_number")).unwrap();
    // Valid claim again
    wtr.write_record(row("C4", "Paid", "2", "30.00")).unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("payment-process"));
    cmd.arg(&output_path)
        .arg("--seed")
        .arg("tests/fixtures/seed.json");

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("skipping malformed claim row"))
        .stdout(predicate::str::contains("\"overall\": 100.0")); // 40 + 2 x 30

    std::fs::remove_file(output_path).ok();
}

#[test]
fn test_invalid_frequency_code_blocks_final_run() {
    let output_path = std::path::PathBuf::from("frequency_claims.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(common::CLAIM_HEADER).unwrap();
    wtr.write_record([
        "C1", "P1", "", "", "Paid", "Approved", "9", common::TAX_ID, common::NPI, "", "Clinic",
        "PLAN-A", "1", "99213", "1", "10.00", "10.00",
    ])
    .unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("payment-process"));
    cmd.arg(&output_path)
        .arg("--seed")
        .arg("tests/fixtures/seed.json")
        .arg("--mode")
        .arg("final");

    cmd.assert()
        .code(1)
        .stdout(predicate::str::contains("frequency-code"))
        .stdout(predicate::str::contains("\"productionMutated\": false"));

    std::fs::remove_file(output_path).ok();
}
