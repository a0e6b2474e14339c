#![allow(dead_code)]

use chrono::NaiveDate;
use payment_process::application::context::RunContext;
use payment_process::application::orchestrator::Orchestrator;
use payment_process::application::retry::RetryConfig;
use payment_process::config::RunConfig;
use payment_process::domain::claim::{Claim, ClaimStatus, ClaimType, ServiceLine};
use payment_process::domain::event::{
    EventStage, FundingSource, InclusionCriteria, PayeeType, PaymentEvent, RunMode,
};
use payment_process::domain::money::Money;
use payment_process::domain::ports::Repositories;
use payment_process::domain::stats::PaymentEventStats;
use payment_process::infrastructure::in_memory::InMemoryStore;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{Error, Write};
use std::path::Path;

pub const TAX_ID: &str = "11-1111111";
pub const NPI: &str = "1234567890";

pub const CLAIM_HEADER: [&str; 17] = [
    "claim_id",
    "parent_claim_id",
    "original_claim_id",
    "void_claim_id",
    "claim_type",
    "status",
    "frequency_code",
    "tax_id",
    "npi",
    "member_id",
    "payee_name",
    "benefit_plan_id",
    "line_number",
    "code",
    "quantity",
    "billed_amount",
    "allowed_amount",
];

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn provider_event(event_id: &str) -> PaymentEvent {
    PaymentEvent {
        event_id: event_id.to_string(),
        payee_type: PayeeType::Provider,
        due_date: date(2025, 11, 1),
        payment_date: date(2025, 11, 15),
        stage: EventStage::Ready,
        inclusion_criteria: InclusionCriteria::default(),
        funding_source: FundingSource {
            id: "FS-1".to_string(),
            account_number: "000123".to_string(),
            description: "Operating account".to_string(),
        },
        interest_rules: None,
        reimbursement_factor: Decimal::ONE,
        minimum_disbursement: Money::ZERO,
    }
}

pub fn claim(id: &str, parent: &str, claim_type: ClaimType, allowed: &[Decimal]) -> Claim {
    Claim {
        claim_id: id.to_string(),
        parent_claim_id: parent.to_string(),
        original_claim_id: None,
        void_claim_id: None,
        claim_type,
        status: ClaimStatus::Approved,
        frequency_code: match claim_type {
            ClaimType::Paid => "1",
            ClaimType::Adjust => "7",
            ClaimType::Void => "8",
        }
        .to_string(),
        tax_id: Some(TAX_ID.to_string()),
        npi: Some(NPI.to_string()),
        member_id: Some("M-1".to_string()),
        payee_name: Some("Clinic One".to_string()),
        payee_address: None,
        benefit_plan_id: Some("PLAN-A".to_string()),
        service_lines: allowed
            .iter()
            .enumerate()
            .map(|(i, amount)| ServiceLine {
                line_number: i as u32 + 1,
                code: "99213".to_string(),
                quantity: Decimal::ONE,
                billed_amount: Money::new(amount.abs()),
                allowed_amount: Money::new(*amount),
            })
            .collect(),
    }
}

pub fn fast_config(event_id: &str, mode: RunMode) -> RunConfig {
    let mut config = RunConfig::new(event_id, mode);
    config.retry = RetryConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        ..RetryConfig::default()
    };
    config
}

pub async fn run_with(store: &InMemoryStore, config: RunConfig) -> PaymentEventStats {
    let ctx = RunContext::new(Repositories::from_store(store.clone()), config).unwrap();
    Orchestrator::new(ctx).run().await
}

pub async fn run(store: &InMemoryStore, event_id: &str, mode: RunMode) -> PaymentEventStats {
    run_with(store, fast_config(event_id, mode)).await
}

/// Writes `parents` Paid claims with two lines each, spread over `providers` payees.
pub fn generate_claims_csv(path: &Path, parents: usize, providers: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(CLAIM_HEADER)?;

    for i in 1..=parents {
        let claim_id = format!("C{i}");
        let parent_id = format!("P{i}");
        let npi = format!("{:010}", i % providers.max(1));
        for line in 1..=2 {
            let line_number = line.to_string();
            wtr.write_record([
                claim_id.as_str(),
                parent_id.as_str(),
                "",
                "",
                "Paid",
                "Approved",
                "1",
                TAX_ID,
                npi.as_str(),
                "",
                "Clinic",
                "PLAN-A",
                line_number.as_str(),
                "99213",
                "1",
                "12.50",
                "10.25",
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_seed(path: &Path, event_id: &str) -> Result<(), Error> {
    let mut file = File::create(path)?;
    write!(
        file,
        r#"{{
  "event": {{
    "event_id": "{event_id}",
    "payee_type": "Provider",
    "due_date": "2025-11-01",
    "payment_date": "2025-11-15",
    "stage": "Ready",
    "funding_source": {{ "id": "FS-1" }}
  }}
}}"#
    )?;
    Ok(())
}
