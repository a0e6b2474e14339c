use super::batch::{BulkOutcome, bulk_write};
use super::retry::RetryPolicy;
use crate::domain::event::PaymentEvent;
use crate::domain::money::Money;
use crate::domain::over_under::{OverUnderKind, OverUnderRecord, OverUnderSummary};
use crate::domain::payment_center::{PaymentCenterClaims, PaymentCenterId};
use crate::domain::ports::PaymentRepositoryRef;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of walking a center's carried balances against its payable.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OffsetOutcome {
    pub payable: Money,
    pub over_applied: Money,
    pub under_applied: Money,
    /// `payable + under_applied - over_applied`.
    pub net: Money,
}

/// What the payee actually receives this cycle and any balance carried forward.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub due: Money,
    pub carried: Option<OverUnderRecord>,
}

/// Walks the staged records oldest first.
///
/// `Under` balances are owed to the payee and are released in full. `Over`
/// balances are recovered up to whatever is still available, never beyond it.
pub fn apply_offsets(payable: Money, summary: &mut OverUnderSummary) -> OffsetOutcome {
    let mut available = payable;
    let mut outcome = OffsetOutcome {
        payable,
        ..Default::default()
    };

    for record in summary.records.iter_mut() {
        let remaining = record.remaining_amount;
        if !remaining.is_positive() {
            record.applied_this_cycle = Money::ZERO;
            continue;
        }
        let applied = match record.kind {
            OverUnderKind::Under => {
                available += remaining;
                outcome.under_applied += remaining;
                remaining
            }
            OverUnderKind::Over => {
                let applied = remaining.min(available.max(Money::ZERO));
                available -= applied;
                outcome.over_applied += applied;
                applied
            }
        };
        record.applied_this_cycle = applied;
        record.remaining_amount = remaining - applied;
    }

    summary.over_remaining = remaining_of(summary, OverUnderKind::Over);
    summary.under_remaining = remaining_of(summary, OverUnderKind::Under);
    outcome.net = available;
    outcome
}

fn remaining_of(summary: &OverUnderSummary, kind: OverUnderKind) -> Money {
    summary
        .records
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.remaining_amount)
        .sum()
}

/// Turns the net of a center into the amount due now.
///
/// A negative net means the payee owes money: nothing is paid and a new
/// `Over` balance is opened. A positive net under the event's minimum
/// disbursement is withheld and carried as an `Under` balance.
pub fn compute_current_cycle(pc_claims: &PaymentCenterClaims, net: Money, event: &PaymentEvent) -> CycleOutcome {
    let sources: Vec<String> = pc_claims.groups.keys().cloned().collect();
    let center = pc_claims.center.id;

    if net.is_negative() {
        let record = OverUnderRecord::new(
            center,
            &event.event_id,
            OverUnderKind::Over,
            net.abs(),
            sources,
            event.payment_date,
        );
        return CycleOutcome {
            due: Money::ZERO,
            carried: Some(record),
        };
    }

    if net.is_positive() && net < event.minimum_disbursement {
        let record = OverUnderRecord::new(
            center,
            &event.event_id,
            OverUnderKind::Under,
            net,
            sources,
            event.payment_date,
        );
        return CycleOutcome {
            due: Money::ZERO,
            carried: Some(record),
        };
    }

    CycleOutcome {
        due: net,
        carried: None,
    }
}

/// Records the cycle's applications in each staged record's history.
///
/// Every staged record is returned, including untouched ones, so a rerun that
/// applies less than a previous attempt also clears the stale entry.
pub fn settle_records(summary: &OverUnderSummary, event_id: &str) -> Vec<OverUnderRecord> {
    summary
        .records
        .iter()
        .map(|record| {
            let mut settled = record.clone();
            if record.applied_this_cycle.is_positive() {
                settled
                    .applications
                    .insert(event_id.to_string(), record.applied_this_cycle);
            } else {
                settled.applications.remove(event_id);
            }
            settled.remaining_amount = settled.outstanding();
            settled
        })
        .collect()
}

/// Moves records of this event that were opened against a staged id onto the winning id.
pub fn remap_records(
    records: &mut [OverUnderRecord],
    event_id: &str,
    remap: &HashMap<PaymentCenterId, PaymentCenterId>,
) {
    for record in records.iter_mut() {
        let Some(winner) = remap.get(&record.payment_center_id) else {
            continue;
        };
        if record.origin_event_id == event_id {
            *record = OverUnderRecord {
                applied_this_cycle: record.applied_this_cycle,
                applications: record.applications.clone(),
                remaining_amount: record.remaining_amount,
                ..OverUnderRecord::new(
                    *winner,
                    event_id,
                    record.kind,
                    record.total_amount,
                    record.sources.clone(),
                    record.created_on,
                )
            };
        } else {
            record.payment_center_id = *winner;
        }
    }
}

pub struct OverUnderLedger {
    repository: PaymentRepositoryRef,
    retry: RetryPolicy,
    cancel: CancellationToken,
    batch_size: usize,
    max_in_flight: usize,
}

impl OverUnderLedger {
    pub fn new(
        repository: PaymentRepositoryRef,
        retry: RetryPolicy,
        cancel: CancellationToken,
        batch_size: usize,
        max_in_flight: usize,
    ) -> Self {
        Self {
            repository,
            retry,
            cancel,
            batch_size: batch_size.max(1),
            max_in_flight,
        }
    }

    /// Read-only: prior-cycle balances per center, rebased to the start of `event_id`.
    pub async fn stage_from_prior_cycles(
        &self,
        event_id: &str,
        centers: &[PaymentCenterId],
    ) -> Result<HashMap<PaymentCenterId, OverUnderSummary>> {
        let mut by_center: HashMap<PaymentCenterId, Vec<OverUnderRecord>> = HashMap::new();
        for batch in centers.chunks(self.batch_size) {
            let repository = self.repository.clone();
            let records = self
                .retry
                .execute(
                    || {
                        let repository = repository.clone();
                        async move { repository.fetch_prior_over_under(batch, event_id).await }
                    },
                    "fetch_prior_over_under",
                    &self.cancel,
                )
                .await?;
            for record in records {
                let staged = record.staged_for(event_id);
                if staged.remaining_amount.is_positive() {
                    by_center
                        .entry(staged.payment_center_id)
                        .or_default()
                        .push(staged);
                }
            }
        }

        let summaries: HashMap<PaymentCenterId, OverUnderSummary> = by_center
            .into_iter()
            .map(|(id, records)| (id, OverUnderSummary::from_records(id, records)))
            .collect();
        info!(centers = summaries.len(), "staged prior over/under balances");
        Ok(summaries)
    }

    /// Final Run only. Idempotent upsert through the bulk writer.
    pub async fn persist(&self, event_id: &str, records: Vec<OverUnderRecord>) -> Result<BulkOutcome> {
        let total = records.len();
        let repository = self.repository.clone();
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let event: Arc<str> = Arc::from(event_id);
        let outcome = bulk_write(records, self.batch_size, self.max_in_flight, &self.cancel, move |batch: Vec<OverUnderRecord>| {
            let repository = repository.clone();
            let retry = retry.clone();
            let cancel = cancel.clone();
            let event = event.clone();
            async move {
                retry
                    .execute(
                        || {
                            let repository = repository.clone();
                            let batch = batch.clone();
                            let event = event.clone();
                            async move {
                                let rounded = batch
                                    .into_iter()
                                    .map(|mut r| {
                                        r.total_amount = r.total_amount.round_cents();
                                        r.remaining_amount = r.remaining_amount.round_cents();
                                        r.applied_this_cycle = r.applied_this_cycle.round_cents();
                                        for applied in r.applications.values_mut() {
                                            *applied = applied.round_cents();
                                        }
                                        r
                                    })
                                    .collect();
                                repository.upsert_over_under(&event, rounded).await
                            }
                        },
                        "upsert_over_under",
                        &cancel,
                    )
                    .await
            }
        })
        .await?;
        debug!(records = total, acknowledged = outcome.acknowledged, "over/under persisted");
        Ok(outcome)
    }
}
