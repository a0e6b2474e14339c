//! Drives one Dry Run or Final Run of a payment event.
//!
//! The orchestrator is the only owner of [`PaymentEventStats`]. It walks the
//! run through a fixed sequence of states; any error escalated by a phase ends
//! the run as `Failed` and is reported in the stats rather than returned.
//!
//! A Final Run writes nothing to production before it has calculated and
//! validated every center: payment centers are staged with reserved ids during
//! resolution and only committed once final validation passes, followed by
//! line payments, claim aggregates and ledger upserts.

use super::batch::{BulkOutcome, OwnershipRegistry, bulk_write};
use super::calculator::{CalculationResources, CenterCalculation, PaymentCalculator};
use super::context::RunContext;
use super::ledger::{
    CycleOutcome, OffsetOutcome, OverUnderLedger, apply_offsets, compute_current_cycle, remap_records,
    settle_records,
};
use super::resolver::{PaymentCenterResolver, id_remap};
use super::sequence::{PAYMENT_CENTER_COUNTER, SERVICE_LINE_PAYMENT_COUNTER};
use super::transformer::{self, TransformOutput};
use super::validation::{self, PaymentCenterIntegrity, SequenceUsage};
use crate::domain::claim::Claim;
use crate::domain::event::{PaymentEvent, RunMode};
use crate::domain::over_under::{OverUnderRecord, OverUnderSummary};
use crate::domain::payment::{ClaimPayment, ServiceLinePayment};
use crate::domain::payment_center::{
    EntryTag, PaymentCenter, PaymentCenterClaims, PaymentCenterId, WorkingPaymentCenterEntry,
};
use crate::domain::ports::{ClaimSource, EntitySet};
use crate::domain::stats::{PaymentEventStats, PhaseTiming, RunStatus, Totals};
use crate::error::{PaymentProcessError, RepositoryError, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Started,
    ConfigLoaded,
    InitialValidated,
    PaymentCentersResolved,
    ClaimsTransformed,
    OverUnderPrepared,
    Calculated,
    FinalValidated,
    Completed,
    Blocked,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Blocked | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Started, ConfigLoaded)
                | (ConfigLoaded, InitialValidated)
                | (InitialValidated, PaymentCentersResolved)
                | (InitialValidated, Completed)
                | (InitialValidated, Blocked)
                | (PaymentCentersResolved, ClaimsTransformed)
                | (ClaimsTransformed, OverUnderPrepared)
                | (OverUnderPrepared, Calculated)
                | (Calculated, FinalValidated)
                | (FinalValidated, Completed)
                | (FinalValidated, Blocked)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything computed for one payment center.
#[derive(Debug, Clone)]
pub struct CenterOutcome {
    pub center_id: PaymentCenterId,
    pub calculation: CenterCalculation,
    pub offsets: OffsetOutcome,
    pub cycle: CycleOutcome,
    /// Staged prior records with this cycle's applications, plus any new carried balance.
    pub ledger_records: Vec<OverUnderRecord>,
}

pub struct Orchestrator {
    ctx: RunContext,
    state: RunState,
}

impl Orchestrator {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            state: RunState::Started,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PaymentProcessError::ProcessingState {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(from = %self.state, to = %next, "run state");
        self.state = next;
        Ok(())
    }

    fn mode(&self) -> RunMode {
        self.ctx.config.mode
    }

    /// Runs to a terminal state and returns the frozen stats.
    pub async fn run(&mut self) -> PaymentEventStats {
        let mut stats = PaymentEventStats::start(&self.ctx.config.event_id, self.mode());
        info!(event_id = %stats.event_id, mode = %stats.mode, "payment event run started");

        if let Err(e) = self.execute(&mut stats).await {
            error!(error = %e, state = %self.state, "payment event run failed");
            self.ctx.cancel.cancel();
            if self.transition(RunState::Failed).is_err() {
                warn!(state = %self.state, "run already terminal when failure surfaced");
            }
            stats.failure = Some(e.to_string());
            if !stats.status().is_terminal() && stats.set_status(RunStatus::Failed).is_ok() {
                self.save_stats(&stats).await;
            }
        }

        info!(
            event_id = %stats.event_id,
            status = %stats.status(),
            total = %stats.totals.overall.round_cents(),
            "payment event run finished"
        );
        stats
    }

    async fn save_stats(&self, stats: &PaymentEventStats) {
        if !self.mode().is_final() {
            return;
        }
        let events = self.ctx.repos.events.clone();
        let result = self
            .ctx
            .retry
            .execute(
                || {
                    let events = events.clone();
                    async move { events.save_stats(stats).await }
                },
                "save_stats",
                &CancellationToken::new(),
            )
            .await;
        if let Err(e) = result {
            error!(error = %e, "failed to save payment event stats");
        }
    }

    async fn finish(&mut self, stats: &mut PaymentEventStats, state: RunState) -> Result<()> {
        self.transition(state)?;
        let status = match state {
            RunState::Blocked => {
                self.ctx.cancel.cancel();
                RunStatus::Blocked
            }
            _ => RunStatus::Completed,
        };
        stats.set_status(status)?;
        self.save_stats(stats).await;
        Ok(())
    }

    async fn load_event(&self) -> Result<Arc<PaymentEvent>> {
        let events = self.ctx.repos.events.clone();
        let event_id = self.ctx.config.event_id.as_str();
        let event = self
            .ctx
            .retry
            .execute(
                || {
                    let events = events.clone();
                    async move { events.load_payment_event(event_id).await }
                },
                "load_payment_event",
                &self.ctx.cancel,
            )
            .await?;
        if event.event_id != event_id {
            return Err(PaymentProcessError::Configuration(format!(
                "store returned event {} for {event_id}",
                event.event_id
            )));
        }
        Ok(Arc::new(event))
    }

    async fn execute(&mut self, stats: &mut PaymentEventStats) -> Result<()> {
        let mode = self.mode();
        let final_run = mode.is_final();
        let event_id = self.ctx.config.event_id.clone();

        // Configuration
        let clock = Instant::now();
        let event = self.load_event().await?;
        let payee_type = self.ctx.config.payee_type.unwrap_or(event.payee_type);
        self.transition(RunState::ConfigLoaded)?;
        stats.set_status(RunStatus::Validating)?;
        record(stats, "config", clock);

        // Initial validation
        let clock = Instant::now();
        let source = if final_run {
            ClaimSource::Production
        } else {
            ClaimSource::WorkingSet
        };
        let claims = transformer::fetch(
            &self.ctx.repos.claims,
            &event_id,
            source,
            None,
            self.ctx.config.batch_size,
            &self.ctx.cancel,
        )
        .await?;
        count_claims(stats, &claims);
        let groups = transformer::group_by_parent(claims.clone());
        let report = validation::aggregate_findings(validation::initial_findings(
            &claims, &groups, &event, payee_type, mode,
        ));
        stats.report = report.clone();
        self.transition(RunState::InitialValidated)?;
        record(stats, "initial-validation", clock);

        if report.blocked {
            if final_run {
                warn!(findings = report.findings.len(), "initial validation blocked the final run");
                return self.finish(stats, RunState::Blocked).await;
            }
            warn!("initial validation found critical issues; dry run continues without writes");
        }
        if self.ctx.config.validate_only {
            info!("validate-only run, stopping after initial validation");
            return self.finish(stats, RunState::Completed).await;
        }

        // Backup before anything can change
        if final_run {
            let clock = Instant::now();
            let backups = self.ctx.repos.backups.clone();
            let backup_event = event_id.as_str();
            let backup = self
                .ctx
                .retry
                .execute(
                    || {
                        let backups = backups.clone();
                        async move { backups.backup(backup_event, &EntitySet::MUTABLE).await }
                    },
                    "backup",
                    &self.ctx.cancel,
                )
                .await?;
            info!(backup = %backup, records = backup.records, "production entities backed up");
            stats.backup_ref = Some(backup.id);
            record(stats, "backup", clock);
        }
        stats.set_status(RunStatus::Calculating)?;

        let sequence_starts = if final_run {
            vec![
                (PAYMENT_CENTER_COUNTER, self.ctx.allocator.current(PAYMENT_CENTER_COUNTER).await?),
                (
                    SERVICE_LINE_PAYMENT_COUNTER,
                    self.ctx.allocator.current(SERVICE_LINE_PAYMENT_COUNTER).await?,
                ),
            ]
        } else {
            Vec::new()
        };

        // Payment center resolution
        let clock = Instant::now();
        let resolver = PaymentCenterResolver::new(
            self.ctx.repos.payment_centers.clone(),
            self.ctx.retry.clone(),
            self.ctx.cancel.clone(),
            self.ctx.config.batch_size,
        );
        let keys = PaymentCenterResolver::derive_keys(&claims, payee_type);
        let templates = PaymentCenterResolver::templates(&claims, payee_type);
        let resolution = resolver.resolve(&keys).await?;
        let entries: Vec<WorkingPaymentCenterEntry> = if final_run {
            let mut entries: Vec<WorkingPaymentCenterEntry> = resolution
                .existing
                .values()
                .cloned()
                .map(|center| WorkingPaymentCenterEntry {
                    tag: EntryTag::Old,
                    center,
                })
                .collect();
            entries.extend(
                resolver
                    .stage_missing(&resolution.missing, &templates, &self.ctx.allocator)
                    .await?,
            );
            entries
        } else {
            PaymentCenterResolver::working_entries(&resolution, &templates)
        };
        let cache = PaymentCenterResolver::build_cache(entries.iter().map(|e| &e.center));
        let centers: HashMap<PaymentCenterId, PaymentCenter> = entries
            .iter()
            .map(|e| (e.center.id, e.center.clone()))
            .collect();
        let unresolved_keys: Vec<String> = keys
            .iter()
            .filter(|k| !cache.contains_key(*k))
            .map(|k| k.to_string())
            .collect();
        self.transition(RunState::PaymentCentersResolved)?;
        record(stats, "payment-centers", clock);

        // Transformation
        let clock = Instant::now();
        let TransformOutput { mut work, unresolved } =
            transformer::to_payment_center_claims(groups, &cache, payee_type, &centers, &HashMap::new());
        stats.unresolved_claims = unresolved.groups.values().map(|g| g.slots().count()).sum();
        self.transition(RunState::ClaimsTransformed)?;
        record(stats, "transform", clock);

        // Over/under staging
        let clock = Instant::now();
        let ledger = OverUnderLedger::new(
            self.ctx.repos.payments.clone(),
            self.ctx.retry.clone(),
            self.ctx.cancel.clone(),
            self.ctx.config.batch_size,
            self.ctx.config.max_in_flight,
        );
        let center_ids: Vec<PaymentCenterId> = work.iter().map(|w| w.center.id).collect();
        let mut summaries = ledger.stage_from_prior_cycles(&event_id, &center_ids).await?;
        for unit in work.iter_mut() {
            unit.over_under = summaries
                .remove(&unit.center.id)
                .unwrap_or_else(|| OverUnderSummary::zero(unit.center.id));
        }
        self.transition(RunState::OverUnderPrepared)?;
        record(stats, "over-under", clock);

        // Calculation
        let clock = Instant::now();
        let mut outcomes = self.calculate(work, event.clone()).await?;
        self.transition(RunState::Calculated)?;
        record(stats, "calculate", clock);

        // Final validation, before anything is committed
        let clock = Instant::now();
        let integrity = PaymentCenterIntegrity {
            unresolved_keys,
            unresolved_groups: unresolved.parent_ids(),
            ..PaymentCenterIntegrity::default()
        };
        let mut usage = Vec::new();
        for (counter, start) in sequence_starts {
            usage.push(SequenceUsage {
                counter: counter.to_string(),
                start,
                reserved: self.ctx.allocator.reserved(counter),
                current: self.ctx.allocator.current(counter).await?,
            });
        }
        let final_report = validation::aggregate_findings(vec![
            validation::validate_payment_centers(&integrity, mode),
            validation::validate_sequences(&usage, mode),
        ]);
        let blocked = final_report.blocked;
        stats.report.merge(final_report);
        stats.totals = totals_of(&outcomes);
        self.transition(RunState::FinalValidated)?;
        record(stats, "final-validation", clock);

        if !final_run {
            return self.finish(stats, RunState::Completed).await;
        }
        if blocked {
            warn!("final validation blocked the run before anything was written");
            return self.finish(stats, RunState::Blocked).await;
        }

        // Commit payment centers staged during resolution
        let clock = Instant::now();
        let staged: Vec<PaymentCenter> = entries
            .iter()
            .filter(|e| e.tag == EntryTag::New)
            .map(|e| e.center.clone())
            .collect();
        let created = resolver.commit_staged(staged.clone()).await?;
        stats.created_payment_centers = created.created.len();
        if !created.created.is_empty() {
            stats.production_mutated = true;
        }
        record(stats, "commit-payment-centers", clock);

        if !created.failed.is_empty() {
            let failed = PaymentCenterIntegrity {
                failed_creations: created.failed.iter().map(|(key, _)| key.to_string()).collect(),
                ..PaymentCenterIntegrity::default()
            };
            stats
                .report
                .merge(validation::aggregate_findings(vec![validation::validate_payment_centers(
                    &failed, mode,
                )]));
            warn!(failed = created.failed.len(), "payment center creation failed; payments were not written");
            return self.finish(stats, RunState::Blocked).await;
        }

        let remap = id_remap(&staged, &created);
        if !remap.is_empty() {
            info!(remapped = remap.len(), "adopting payment centers created concurrently");
            apply_remap(&mut outcomes, &event_id, &remap);
            stats.totals = totals_of(&outcomes);
        }

        let clock = Instant::now();
        self.persist(&ledger, &event_id, outcomes).await?;
        stats.production_mutated = true;
        record(stats, "persist", clock);

        self.finish(stats, RunState::Completed).await
    }

    /// Calculates every center on the payment-center pool, one task per center.
    async fn calculate(&self, work: Vec<PaymentCenterClaims>, event: Arc<PaymentEvent>) -> Result<Vec<CenterOutcome>> {
        let mode = self.mode();
        let registry: OwnershipRegistry<PaymentCenterId> = OwnershipRegistry::new();
        let resources = CalculationResources {
            pools: self.ctx.pools.clone(),
            allocator: self.ctx.allocator.clone(),
            batch_size: self.ctx.config.batch_size,
            chunk_size: self.ctx.config.sequence_chunk_size,
        };

        self.ctx
            .pools
            .payment_center
            .run(work, move |pc_claims, _token| {
                let registry = registry.clone();
                let resources = resources.clone();
                let event = event.clone();
                async move {
                    let _guard = registry.acquire(pc_claims.center.id)?;
                    let mut calculator = PaymentCalculator::new(mode);
                    let calculation = match mode {
                        RunMode::DryRun => calculator.estimate_center(&pc_claims, &event)?,
                        RunMode::Final => {
                            calculator
                                .compute_center(&pc_claims, event.clone(), &resources)
                                .await?
                        }
                    };

                    let mut summary = pc_claims.over_under.clone();
                    let offsets = apply_offsets(calculation.payable, &mut summary);
                    let cycle = compute_current_cycle(&pc_claims, offsets.net, &event);
                    let mut ledger_records = settle_records(&summary, &event.event_id);
                    ledger_records.extend(cycle.carried.clone());

                    Ok(CenterOutcome {
                        center_id: pc_claims.center.id,
                        calculation,
                        offsets,
                        cycle,
                        ledger_records,
                    })
                }
            })
            .await
    }

    async fn persist(&self, ledger: &OverUnderLedger, event_id: &str, outcomes: Vec<CenterOutcome>) -> Result<()> {
        let mut lines: Vec<ServiceLinePayment> = Vec::new();
        let mut claims: Vec<ClaimPayment> = Vec::new();
        let mut records: Vec<OverUnderRecord> = Vec::new();
        for outcome in outcomes {
            for claim in outcome.calculation.claims {
                let rounded = claim.rounded();
                lines.extend(rounded.service_lines.iter().cloned());
                claims.push(rounded);
            }
            records.extend(outcome.ledger_records);
        }

        let batch_size = self.ctx.config.batch_size;
        let in_flight = self.ctx.config.max_in_flight;

        let repository = self.ctx.repos.payments.clone();
        let retry = self.ctx.retry.clone();
        let cancel = self.ctx.cancel.clone();
        let line_outcome = bulk_write(lines, batch_size, in_flight, &self.ctx.cancel, move |batch: Vec<ServiceLinePayment>| {
            let (repository, retry, cancel) = (repository.clone(), retry.clone(), cancel.clone());
            async move {
                retry
                    .execute(
                        || {
                            let repository = repository.clone();
                            let batch = batch.clone();
                            async move { repository.persist_service_line_payment(batch).await }
                        },
                        "persist_service_line_payment",
                        &cancel,
                    )
                    .await
            }
        })
        .await?;
        ensure_complete("service line payments", &line_outcome)?;

        let repository = self.ctx.repos.payments.clone();
        let retry = self.ctx.retry.clone();
        let cancel = self.ctx.cancel.clone();
        let claim_outcome = bulk_write(claims, batch_size, in_flight, &self.ctx.cancel, move |batch: Vec<ClaimPayment>| {
            let (repository, retry, cancel) = (repository.clone(), retry.clone(), cancel.clone());
            async move {
                retry
                    .execute(
                        || {
                            let repository = repository.clone();
                            let batch = batch.clone();
                            async move { repository.persist_claim_aggregate(batch).await }
                        },
                        "persist_claim_aggregate",
                        &cancel,
                    )
                    .await
            }
        })
        .await?;
        ensure_complete("claim payments", &claim_outcome)?;

        let ledger_outcome = ledger.persist(event_id, records).await?;
        ensure_complete("over/under records", &ledger_outcome)?;

        info!(
            lines = line_outcome.acknowledged,
            claims = claim_outcome.acknowledged,
            ledger = ledger_outcome.acknowledged,
            "final run persisted"
        );
        Ok(())
    }
}

fn record(stats: &mut PaymentEventStats, phase: &str, started: Instant) {
    stats.timings.push(PhaseTiming {
        phase: phase.to_string(),
        millis: started.elapsed().as_millis(),
    });
}

fn count_claims(stats: &mut PaymentEventStats, claims: &[Claim]) {
    for claim in claims {
        *stats.claim_counts.entry(claim.claim_type).or_default() += 1;
        *stats.claim_status_counts.entry(claim.status).or_default() += 1;
    }
}

fn totals_of(outcomes: &[CenterOutcome]) -> Totals {
    let mut totals = Totals::default();
    for outcome in outcomes {
        totals.add(outcome.center_id, outcome.cycle.due);
    }
    totals
}

fn ensure_complete(what: &str, outcome: &BulkOutcome) -> Result<()> {
    if outcome.is_complete() {
        return Ok(());
    }
    let sample: BTreeSet<&str> = outcome.failed.iter().take(5).map(|(id, _)| id.as_str()).collect();
    Err(RepositoryError::Backend(format!(
        "{} {what} were not acknowledged (e.g. {:?})",
        outcome.failed.len(),
        sample
    ))
    .into())
}

fn apply_remap(
    outcomes: &mut [CenterOutcome],
    event_id: &str,
    remap: &HashMap<PaymentCenterId, PaymentCenterId>,
) {
    for outcome in outcomes.iter_mut() {
        let Some(winner) = remap.get(&outcome.center_id).copied() else {
            continue;
        };
        outcome.center_id = winner;
        for claim in outcome.calculation.claims.iter_mut() {
            claim.payment_center_id = winner;
            for line in claim.service_lines.iter_mut() {
                line.payment_center_id = winner;
            }
        }
        for estimate in outcome.calculation.estimates.iter_mut() {
            estimate.payment_center_id = winner;
        }
        remap_records(&mut outcome.ledger_records, event_id, remap);
    }
}
