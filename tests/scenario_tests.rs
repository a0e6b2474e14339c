use payment_process::application::sequence::PAYMENT_CENTER_COUNTER;
use payment_process::application::validation::rules;
use payment_process::domain::claim::ClaimType;
use payment_process::domain::event::RunMode;
use payment_process::domain::money::Money;
use payment_process::domain::over_under::{OverUnderKind, OverUnderRecord};
use payment_process::domain::payment_center::{PaymentCenter, PaymentCenterId, PaymentCenterKey};
use payment_process::domain::stats::{RunStatus, Severity};
use payment_process::infrastructure::in_memory::InMemoryStore;
use rust_decimal_macros::dec;

mod common;
use common::{NPI, TAX_ID, claim, date, provider_event};

async fn scenario_a_store(event_id: &str) -> InMemoryStore {
    let store = InMemoryStore::new();
    store.insert_event(provider_event(event_id)).await;
    store
        .load_claims(
            event_id,
            vec![
                claim("C1", "P1", ClaimType::Paid, &[dec!(100.00), dec!(50.00)]),
                claim("C2", "P1", ClaimType::Adjust, &[dec!(-20.00)]),
            ],
        )
        .await;
    store
}

/// Center 7 already exists and carries a 50.00 balance from PE-1.
async fn scenario_b_store(kind: OverUnderKind) -> InMemoryStore {
    let store = InMemoryStore::new();
    store.insert_event(provider_event("PE-2")).await;
    store
        .insert_payment_center(PaymentCenter::from_claim(
            PaymentCenterId(7),
            PaymentCenterKey::Provider {
                tax_id: TAX_ID.into(),
                npi: NPI.into(),
            },
            None,
        ))
        .await;
    store.set_sequence(PAYMENT_CENTER_COUNTER, 8).await;
    store
        .insert_over_under(OverUnderRecord::new(
            PaymentCenterId(7),
            "PE-1",
            kind,
            Money::new(dec!(50.00)),
            vec!["P0".into()],
            date(2025, 10, 1),
        ))
        .await;
    store
        .load_claims(
            "PE-2",
            vec![claim("C1", "P1", ClaimType::Paid, &[dec!(500.00)])],
        )
        .await;
    store
}

#[tokio::test]
async fn test_scenario_a_dry_run_estimate() {
    let store = scenario_a_store("PE-1").await;

    let stats = run_dry(&store, "PE-1").await;

    assert_eq!(stats.status(), RunStatus::Completed);
    assert_eq!(stats.totals().overall, Money::new(dec!(130.00)));
    assert_eq!(stats.report().count(Severity::Critical), 0);
    assert!(!stats.production_mutated());
    assert_eq!(store.production_writes(), 0);
    assert!(store.saved_stats("PE-1").await.is_none());
}

#[tokio::test]
async fn test_scenario_a_final_run_persists_payments() {
    let store = scenario_a_store("PE-1").await;

    let stats = common::run(&store, "PE-1", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Completed, "{:?}", stats.failure());
    assert_eq!(stats.totals().overall, Money::new(dec!(130.00)));
    assert_eq!(stats.created_payment_centers(), 1);
    assert!(stats.production_mutated());
    assert!(stats.backup_ref().is_some());

    let claims = store.claim_payments().await;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].paid_total, Money::new(dec!(150.00)));
    assert_eq!(claims[0].adjust_total, Money::new(dec!(-20.00)));
    assert_eq!(claims[0].total_amount, Money::new(dec!(130.00)));

    let lines = store.line_payments().await;
    let mut ids: Vec<u64> = lines.iter().map(|l| l.sequence_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(lines.iter().all(|l| l.payment_center_id == claims[0].payment_center_id));

    let saved = store.saved_stats("PE-1").await.unwrap();
    assert_eq!(saved.status(), RunStatus::Completed);
}

#[tokio::test]
async fn test_scenario_b_under_balance_raises_payment() {
    let store = scenario_b_store(OverUnderKind::Under).await;

    let stats = common::run(&store, "PE-2", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Completed, "{:?}", stats.failure());
    assert_eq!(stats.totals().overall, Money::new(dec!(550.00)));
    assert_eq!(stats.created_payment_centers(), 0);

    let ledger = store.over_under_records().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].remaining_amount, Money::ZERO);
    assert_eq!(ledger[0].applications["PE-2"], Money::new(dec!(50.00)));
}

#[tokio::test]
async fn test_scenario_b_over_balance_is_recovered() {
    let store = scenario_b_store(OverUnderKind::Over).await;

    let stats = common::run(&store, "PE-2", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Completed, "{:?}", stats.failure());
    assert_eq!(stats.totals().overall, Money::new(dec!(450.00)));
    assert_eq!(
        stats.totals().by_payment_center[&PaymentCenterId(7)],
        Money::new(dec!(450.00))
    );
    let ledger = store.over_under_records().await;
    assert_eq!(ledger[0].remaining_amount, Money::ZERO);
}

#[tokio::test]
async fn test_scenario_b_rerun_does_not_apply_twice() {
    let store = scenario_b_store(OverUnderKind::Under).await;

    let first = common::run(&store, "PE-2", RunMode::Final).await;
    let second = common::run(&store, "PE-2", RunMode::Final).await;

    assert_eq!(first.totals().overall, Money::new(dec!(550.00)));
    assert_eq!(second.totals().overall, Money::new(dec!(550.00)));
    let ledger = store.over_under_records().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].applications.len(), 1);
}

#[tokio::test]
async fn test_final_rerun_replaces_line_payments() {
    let store = scenario_a_store("PE-1").await;

    let first = common::run(&store, "PE-1", RunMode::Final).await;
    let second = common::run(&store, "PE-1", RunMode::Final).await;

    assert_eq!(first.status(), RunStatus::Completed, "{:?}", first.failure());
    assert_eq!(second.status(), RunStatus::Completed, "{:?}", second.failure());

    let claims = store.claim_payments().await;
    let lines = store.line_payments().await;
    assert_eq!(claims.len(), 1);
    assert_eq!(lines.len(), 3);
    let line_sum: Money = lines.iter().map(|l| l.paid_amount).sum();
    assert_eq!(line_sum, claims[0].total_amount);
    assert_eq!(line_sum, Money::new(dec!(130.00)));

    // The second backup holds the center, the three lines and the claim.
    assert_eq!(store.backup_count().await, 2);
    assert_eq!(store.last_backup_records().await, Some(5));
}

#[tokio::test]
async fn test_scenario_c_duplicate_blocks_final_run() {
    let store = InMemoryStore::new();
    store.insert_event(provider_event("PE-3")).await;
    store
        .load_claims(
            "PE-3",
            vec![
                claim("C1", "P1", ClaimType::Paid, &[dec!(100.00)]),
                claim("C1", "P1", ClaimType::Paid, &[dec!(100.00)]),
            ],
        )
        .await;

    let stats = common::run(&store, "PE-3", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Blocked);
    assert!(stats.report().blocked);
    let duplicate = stats
        .report()
        .findings
        .iter()
        .find(|f| f.rule_id == rules::DUPLICATE_CLAIM_ID)
        .unwrap();
    assert_eq!(duplicate.severity, Severity::Critical);
    assert_eq!(duplicate.count, 2);
    assert_eq!(duplicate.sample_ids, vec!["C1".to_string()]);

    assert_eq!(store.production_writes(), 0);
    assert_eq!(store.backup_count().await, 0);
    assert!(!stats.production_mutated());
    assert_eq!(
        store.saved_stats("PE-3").await.map(|s| s.status()),
        Some(RunStatus::Blocked)
    );
}

#[tokio::test]
async fn test_split_payee_group_blocks_final_run_before_any_write() {
    let store = InMemoryStore::new();
    store.insert_event(provider_event("PE-4")).await;
    let mut adjust = claim("C2", "P1", ClaimType::Adjust, &[dec!(-20.00)]);
    adjust.npi = Some("9999999999".into());
    adjust.original_claim_id = Some("C1".into());
    store
        .load_claims(
            "PE-4",
            vec![claim("C1", "P1", ClaimType::Paid, &[dec!(150.00)]), adjust],
        )
        .await;

    let stats = common::run(&store, "PE-4", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Blocked);
    let integrity = stats
        .report()
        .findings
        .iter()
        .find(|f| f.rule_id == rules::PAYMENT_CENTER_INTEGRITY)
        .unwrap();
    assert_eq!(integrity.severity, Severity::Critical);
    assert_eq!(integrity.sample_ids, vec!["P1".to_string()]);

    assert_eq!(store.production_writes(), 0);
    assert_eq!(store.payment_center_count().await, 0);
    assert_eq!(store.backup_count().await, 0);
    assert_eq!(stats.created_payment_centers(), 0);
    assert!(!stats.production_mutated());
}

#[tokio::test]
async fn test_scenario_c_dry_run_reports_and_continues() {
    let store = InMemoryStore::new();
    store.insert_event(provider_event("PE-3")).await;
    store
        .load_claims(
            "PE-3",
            vec![
                claim("C1", "P1", ClaimType::Paid, &[dec!(100.00)]),
                claim("C1", "P1", ClaimType::Paid, &[dec!(100.00)]),
            ],
        )
        .await;

    let stats = run_dry(&store, "PE-3").await;

    assert_eq!(stats.status(), RunStatus::Completed);
    assert!(stats.report().blocked);
    assert_eq!(stats.report().count(Severity::Critical), 1);
    assert_eq!(store.production_writes(), 0);
}

#[tokio::test]
async fn test_dry_run_is_repeatable_without_writes() {
    let store = scenario_b_store(OverUnderKind::Under).await;

    let first = run_dry(&store, "PE-2").await;
    let second = run_dry(&store, "PE-2").await;

    assert_eq!(first.totals(), second.totals());
    assert_eq!(first.totals().overall, Money::new(dec!(550.00)));
    assert_eq!(store.production_writes(), 0);
    assert_eq!(store.payment_center_count().await, 1);
    assert_eq!(store.over_under_records().await[0].remaining_amount, Money::new(dec!(50.00)));
}

#[tokio::test]
async fn test_validate_only_stops_before_backup() {
    let store = scenario_a_store("PE-1").await;
    let mut config = common::fast_config("PE-1", RunMode::Final);
    config.validate_only = true;

    let stats = common::run_with(&store, config).await;

    assert_eq!(stats.status(), RunStatus::Completed);
    assert_eq!(stats.totals().overall, Money::ZERO);
    assert_eq!(store.backup_count().await, 0);
    assert_eq!(store.production_writes(), 0);
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let store = scenario_a_store("PE-1").await;
    store.fail_next(2);

    let stats = common::run(&store, "PE-1", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Completed, "{:?}", stats.failure());
    assert_eq!(stats.totals().overall, Money::new(dec!(130.00)));
}

#[tokio::test]
async fn test_unknown_event_fails_the_run() {
    let store = InMemoryStore::new();

    let stats = common::run(&store, "PE-404", RunMode::Final).await;

    assert_eq!(stats.status(), RunStatus::Failed);
    assert!(stats.failure().unwrap().contains("PE-404"));
    assert_eq!(store.production_writes(), 0);
}

async fn run_dry(store: &InMemoryStore, event_id: &str) -> payment_process::domain::stats::PaymentEventStats {
    common::run(store, event_id, RunMode::DryRun).await
}
