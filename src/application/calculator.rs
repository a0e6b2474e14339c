use super::batch::Pools;
use super::sequence::{SERVICE_LINE_PAYMENT_COUNTER, SequenceAllocator};
use crate::domain::claim::{Claim, ClaimType, ParentClaimGroup, ServiceLine};
use crate::domain::event::{InclusionCriteria, InterestRules, PaymentEvent, RunMode};
use crate::domain::money::Money;
use crate::domain::payment::{ClaimLevelEstimate, ClaimPayment, ServiceLinePayment};
use crate::domain::payment_center::{PaymentCenterClaims, PaymentCenterId};
use crate::domain::sequence::SequenceChunk;
use crate::error::{PaymentProcessError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculatorState {
    Estimating,
    Computing,
    Done,
}

impl fmt::Display for CalculatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Where a line payment belongs.
#[derive(Debug, Clone, PartialEq)]
pub struct LineContext {
    pub sequence_id: u64,
    pub payment_center_id: PaymentCenterId,
    pub parent_claim_id: String,
    pub claim_id: String,
    pub claim_type: ClaimType,
}

/// Slots that pass the event's inclusion criteria, in rollup order.
pub fn included_slots<'a>(group: &'a ParentClaimGroup, criteria: &InclusionCriteria) -> Vec<&'a Claim> {
    group
        .slots()
        .filter(|c| criteria.payable_statuses.contains(&c.status))
        .filter(|c| criteria.allows_plan(c.benefit_plan_id.as_deref()))
        .collect()
}

fn line_amount(line: &ServiceLine, factor: Decimal) -> Money {
    line.allowed_amount * line.quantity * factor
}

pub fn compute_service_line(line: &ServiceLine, event: &PaymentEvent, ctx: &LineContext) -> ServiceLinePayment {
    ServiceLinePayment {
        sequence_id: ctx.sequence_id,
        event_id: event.event_id.clone(),
        payment_center_id: ctx.payment_center_id,
        parent_claim_id: ctx.parent_claim_id.clone(),
        claim_id: ctx.claim_id.clone(),
        claim_type: ctx.claim_type,
        line: line.clone(),
        paid_amount: line_amount(line, event.reimbursement_factor),
    }
}

/// `paid + adjust - |void|` over the group's line payments.
///
/// Lines are summed in a canonical order so the result never depends on the
/// order the line tasks finished in.
pub fn rollup_to_claim(
    event_id: &str,
    payment_center_id: PaymentCenterId,
    parent_claim_id: &str,
    mut lines: Vec<ServiceLinePayment>,
) -> ClaimPayment {
    lines.sort_by(|a, b| {
        a.claim_type
            .cmp(&b.claim_type)
            .then_with(|| a.claim_id.cmp(&b.claim_id))
            .then_with(|| a.line.line_number.cmp(&b.line.line_number))
            .then_with(|| a.sequence_id.cmp(&b.sequence_id))
    });

    let mut paid_total = Money::ZERO;
    let mut adjust_total = Money::ZERO;
    let mut void_sum = Money::ZERO;
    let mut claim_ids: Vec<String> = Vec::new();
    for line in &lines {
        match line.claim_type {
            ClaimType::Paid => paid_total += line.paid_amount,
            ClaimType::Adjust => adjust_total += line.paid_amount,
            ClaimType::Void => void_sum += line.paid_amount,
        }
        if !claim_ids.contains(&line.claim_id) {
            claim_ids.push(line.claim_id.clone());
        }
    }
    let void_total = -void_sum.abs();

    ClaimPayment {
        event_id: event_id.to_string(),
        payment_center_id,
        parent_claim_id: parent_claim_id.to_string(),
        claim_ids,
        paid_total,
        adjust_total,
        void_total,
        interest_amount: Money::ZERO,
        total_amount: paid_total + adjust_total + void_total,
        service_lines: lines,
    }
}

/// Days past due beyond the grace period.
pub fn days_late(rules: &InterestRules, due: NaiveDate, payment_date: NaiveDate) -> i64 {
    (payment_date - due).num_days() - i64::from(rules.grace_period_days)
}

pub fn interest_on(amount: Money, rules: &InterestRules, due: NaiveDate, payment_date: NaiveDate) -> Money {
    let days = days_late(rules, due, payment_date);
    if days <= 0 || !amount.is_positive() {
        return Money::ZERO;
    }
    Money::new(amount.value() * rules.rate * Decimal::from(days) / rules.day_count.basis())
}

pub fn apply_interest(
    claim: &mut ClaimPayment,
    rules: Option<&InterestRules>,
    due: NaiveDate,
    payment_date: NaiveDate,
) {
    let Some(rules) = rules else {
        return;
    };
    let interest = interest_on(claim.total_amount, rules, due, payment_date);
    claim.interest_amount = interest;
    claim.total_amount += interest;
}

/// One estimate per parent group with at least one payable slot.
pub fn estimate(pc_claims: &PaymentCenterClaims, event: &PaymentEvent) -> Vec<ClaimLevelEstimate> {
    let projection = event
        .interest_rules
        .as_ref()
        .filter(|rules| rules.project_in_dry_run);

    pc_claims
        .groups
        .values()
        .filter_map(|group| {
            let slots = included_slots(group, &event.inclusion_criteria);
            if slots.is_empty() {
                return None;
            }
            let mut amount = Money::ZERO;
            for claim in slots {
                let claim_amount: Money = claim
                    .service_lines
                    .iter()
                    .map(|line| line_amount(line, event.reimbursement_factor))
                    .sum();
                match claim.claim_type {
                    ClaimType::Paid | ClaimType::Adjust => amount += claim_amount,
                    ClaimType::Void => amount -= claim_amount.abs(),
                }
            }
            let projected_interest = projection
                .map(|rules| interest_on(amount, rules, event.due_date, event.payment_date))
                .unwrap_or(Money::ZERO);
            Some(ClaimLevelEstimate {
                parent_claim_id: group.parent_id.clone(),
                payment_center_id: pc_claims.center.id,
                amount,
                projected_interest,
            })
        })
        .collect()
}

/// Pools and allocator used by Final Run line computation.
#[derive(Clone)]
pub struct CalculationResources {
    pub pools: Pools,
    pub allocator: Arc<SequenceAllocator>,
    pub batch_size: usize,
    /// Upper bound on the ids one reservation takes from the counter.
    pub chunk_size: u64,
}

/// Calculated payments of one center before offsets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CenterCalculation {
    pub claims: Vec<ClaimPayment>,
    pub estimates: Vec<ClaimLevelEstimate>,
    pub payable: Money,
}

/// Per-center calculator. Dry Run starts `Estimating`, Final Run `Computing`;
/// both end in `Done` and refuse further work.
pub struct PaymentCalculator {
    state: CalculatorState,
}

impl PaymentCalculator {
    pub fn new(mode: RunMode) -> Self {
        let state = match mode {
            RunMode::DryRun => CalculatorState::Estimating,
            RunMode::Final => CalculatorState::Computing,
        };
        Self { state }
    }

    pub fn state(&self) -> CalculatorState {
        self.state
    }

    fn require_state(&self, state: CalculatorState) -> Result<()> {
        if self.state != state {
            return Err(PaymentProcessError::ProcessingState {
                from: self.state.to_string(),
                to: state.to_string(),
            });
        }
        Ok(())
    }

    pub fn estimate_center(&mut self, pc_claims: &PaymentCenterClaims, event: &PaymentEvent) -> Result<CenterCalculation> {
        self.require_state(CalculatorState::Estimating)?;
        let estimates = estimate(pc_claims, event);
        let payable = estimates.iter().map(|e| e.total()).sum();
        self.state = CalculatorState::Done;
        Ok(CenterCalculation {
            claims: Vec::new(),
            estimates,
            payable,
        })
    }

    /// Computes every line of the center, then rolls lines up per parent group.
    ///
    /// Parent groups are split into disjoint claim batches. Before any work each
    /// batch reserves ids for all of its lines, in chunks of at most `chunk_size`,
    /// then fans its lines out to the service-line pool; a group is rolled up
    /// only after all of its lines are done.
    pub async fn compute_center(
        &mut self,
        pc_claims: &PaymentCenterClaims,
        event: Arc<PaymentEvent>,
        resources: &CalculationResources,
    ) -> Result<CenterCalculation> {
        self.require_state(CalculatorState::Computing)?;

        let center_id = pc_claims.center.id;
        let groups: Vec<ParentClaimGroup> = pc_claims.groups.values().cloned().collect();
        let batches: Vec<Vec<ParentClaimGroup>> = groups
            .chunks(resources.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        let line_pool = resources.pools.service_line.clone();
        let allocator = resources.allocator.clone();
        let chunk_size = resources.chunk_size.max(1);
        let batch_event = event.clone();
        let per_batch = resources
            .pools
            .claim_batch
            .run(batches, move |batch, token| {
                let line_pool = line_pool.clone();
                let allocator = allocator.clone();
                let event = batch_event.clone();
                async move {
                    let criteria = &event.inclusion_criteria;
                    let line_count: usize = batch
                        .iter()
                        .flat_map(|g| included_slots(g, criteria))
                        .map(|c| c.service_lines.len())
                        .sum();
                    let mut chunks: Vec<SequenceChunk> = Vec::new();
                    let mut unreserved = line_count as u64;
                    while unreserved > 0 {
                        let size = unreserved.min(chunk_size);
                        chunks.push(allocator.allocate(SERVICE_LINE_PAYMENT_COUNTER, size).await?);
                        unreserved -= size;
                    }
                    let mut ids = chunks
                        .into_iter()
                        .flat_map(|mut chunk| std::iter::from_fn(move || chunk.next_id()));

                    let mut claims = Vec::new();
                    for group in &batch {
                        if token.is_cancelled() {
                            return Err(PaymentProcessError::Cancelled);
                        }
                        let mut jobs = Vec::new();
                        for claim in included_slots(group, criteria) {
                            for line in &claim.service_lines {
                                let sequence_id = ids.next().ok_or_else(|| {
                                    PaymentProcessError::SequenceAllocation {
                                        counter: SERVICE_LINE_PAYMENT_COUNTER.to_string(),
                                        reason: "reserved chunk exhausted".to_string(),
                                    }
                                })?;
                                let ctx = LineContext {
                                    sequence_id,
                                    payment_center_id: center_id,
                                    parent_claim_id: group.parent_id.clone(),
                                    claim_id: claim.claim_id.clone(),
                                    claim_type: claim.claim_type,
                                };
                                jobs.push((line.clone(), ctx));
                            }
                        }
                        if jobs.is_empty() {
                            continue;
                        }

                        let line_event = event.clone();
                        let lines = line_pool
                            .run(jobs, move |(line, ctx), _| {
                                let event = line_event.clone();
                                async move { Ok(compute_service_line(&line, &event, &ctx)) }
                            })
                            .await?;

                        let mut claim = rollup_to_claim(&event.event_id, center_id, &group.parent_id, lines);
                        apply_interest(
                            &mut claim,
                            event.interest_rules.as_ref(),
                            event.due_date,
                            event.payment_date,
                        );
                        claims.push(claim);
                    }
                    Ok(claims)
                }
            })
            .await?;

        let claims: Vec<ClaimPayment> = per_batch.into_iter().flatten().collect();
        let payable = claims.iter().map(|c| c.total_amount).sum();
        debug!(center = %center_id, claims = claims.len(), %payable, "center computed");
        self.state = CalculatorState::Done;
        Ok(CenterCalculation {
            claims,
            estimates: Vec::new(),
            payable,
        })
    }
}
