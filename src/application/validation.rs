//! Validation rules.
//!
//! Every rule is a pure function over the records it inspects and returns a
//! [`ValidationFinding`]; a finding with count 0 means the rule passed.
//! Validation never fails a run by itself: it only reports, and the
//! orchestrator decides what a blocked report means for the current mode.

use crate::domain::claim::{Claim, ClaimType, FrequencyCode, ParentClaimGroup};
use crate::domain::event::{EventStage, InclusionCriteria, PayeeType, PaymentEvent, RunMode};
use crate::domain::payment_center::PaymentCenterKey;
use crate::domain::stats::{Severity, ValidationFinding, ValidationReport};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub mod rules {
    pub const FREQUENCY_CODE: &str = "frequency-code";
    pub const PAYEE_IDENTIFIER: &str = "payee-identifier";
    pub const DUPLICATE_CLAIM_ID: &str = "duplicate-claim-id";
    pub const BENEFIT_PLAN: &str = "benefit-plan";
    pub const EVENT_STAGE: &str = "event-stage";
    pub const PAYMENT_CENTER_INTEGRITY: &str = "payment-center-integrity";
    pub const SEQUENCE_COUNTER: &str = "sequence-counter";
    pub const NEGATIVE_AMOUNT: &str = "negative-amount";
    pub const MISSING_PARENT_PAID: &str = "missing-parent-paid";
    pub const VOID_LINKAGE: &str = "void-linkage";
    pub const PARENT_SLOT_CONFLICT: &str = "parent-slot-conflict";
    pub const FREQUENCY_DISTRIBUTION: &str = "frequency-distribution";
}

fn clear(severity: Severity, rule_id: &str) -> ValidationFinding {
    ValidationFinding::new(severity, rule_id, "ok", Vec::new())
}

pub fn validate_frequency_codes(claims: &[Claim]) -> ValidationFinding {
    let affected: Vec<String> = claims
        .iter()
        .filter(|c| c.frequency().is_none())
        .map(|c| c.claim_id.clone())
        .collect();
    if affected.is_empty() {
        return clear(Severity::Critical, rules::FREQUENCY_CODE);
    }
    ValidationFinding::new(
        Severity::Critical,
        rules::FREQUENCY_CODE,
        format!("{} claim(s) carry a frequency code outside 1,2,3,4,5,7,8", affected.len()),
        affected,
    )
}

pub fn validate_identifiers(claims: &[Claim], payee_type: PayeeType) -> ValidationFinding {
    let affected: Vec<String> = claims
        .iter()
        .filter(|c| PaymentCenterKey::from_claim(c, payee_type).is_none())
        .map(|c| c.claim_id.clone())
        .collect();
    if affected.is_empty() {
        return clear(Severity::Critical, rules::PAYEE_IDENTIFIER);
    }
    let wanted = match payee_type {
        PayeeType::Provider => "TaxID/NPI",
        PayeeType::Member => "MemberID",
    };
    ValidationFinding::new(
        Severity::Critical,
        rules::PAYEE_IDENTIFIER,
        format!("{} claim(s) missing {wanted}", affected.len()),
        affected,
    )
}

/// Counts every record that shares its claim id with another record.
pub fn validate_duplicates(claims: &[Claim]) -> ValidationFinding {
    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for claim in claims {
        *occurrences.entry(claim.claim_id.as_str()).or_default() += 1;
    }
    let duplicated: Vec<(&str, usize)> = occurrences.into_iter().filter(|(_, n)| *n > 1).collect();
    let count: usize = duplicated.iter().map(|(_, n)| n).sum();
    if count == 0 {
        return clear(Severity::Critical, rules::DUPLICATE_CLAIM_ID);
    }
    ValidationFinding::counted(
        Severity::Critical,
        rules::DUPLICATE_CLAIM_ID,
        format!("{} record(s) share {} claim id(s)", count, duplicated.len()),
        count,
        duplicated.into_iter().map(|(id, _)| id.to_string()),
    )
}

pub fn validate_benefit_plan(claims: &[Claim], criteria: &InclusionCriteria) -> ValidationFinding {
    let affected: Vec<String> = claims
        .iter()
        .filter(|c| {
            let plan = c.benefit_plan_id.as_deref().map(str::trim).filter(|p| !p.is_empty());
            plan.is_none() || !criteria.allows_plan(plan)
        })
        .map(|c| c.claim_id.clone())
        .collect();
    if affected.is_empty() {
        return clear(Severity::Critical, rules::BENEFIT_PLAN);
    }
    ValidationFinding::new(
        Severity::Critical,
        rules::BENEFIT_PLAN,
        format!(
            "{} claim(s) have a missing or disallowed benefit plan for criteria {}",
            affected.len(),
            criteria.id
        ),
        affected,
    )
}

/// A Final Run may only process an event that is `Ready`.
pub fn validate_event_stage(event: &PaymentEvent, mode: RunMode) -> ValidationFinding {
    if !mode.is_final() || event.stage == EventStage::Ready {
        return clear(Severity::Critical, rules::EVENT_STAGE);
    }
    ValidationFinding::new(
        Severity::Critical,
        rules::EVENT_STAGE,
        format!("event stage is {:?}, Final Run requires Ready", event.stage),
        vec![event.event_id.clone()],
    )
}

/// Adjust lines carry signed deltas, so only Paid and Void are checked.
pub fn validate_negative_dollars(claims: &[Claim]) -> ValidationFinding {
    let affected: Vec<String> = claims
        .iter()
        .filter(|c| c.claim_type != ClaimType::Adjust)
        .filter(|c| c.service_lines.iter().any(|l| l.has_negative_amount()))
        .map(|c| c.claim_id.clone())
        .collect();
    if affected.is_empty() {
        return clear(Severity::Warning, rules::NEGATIVE_AMOUNT);
    }
    ValidationFinding::new(
        Severity::Warning,
        rules::NEGATIVE_AMOUNT,
        format!("{} Paid/Void claim(s) contain negative amounts", affected.len()),
        affected,
    )
}

/// Groups flagged `unresolved` while grouping: a Void/Adjust with no Paid slot
/// and no link to an original claim of the run.
pub fn validate_missing_parent_paid(groups: &BTreeMap<String, ParentClaimGroup>) -> ValidationFinding {
    let affected: Vec<String> = groups
        .values()
        .filter(|g| g.unresolved)
        .map(|g| g.parent_id.clone())
        .collect();
    if affected.is_empty() {
        return clear(Severity::Warning, rules::MISSING_PARENT_PAID);
    }
    ValidationFinding::new(
        Severity::Warning,
        rules::MISSING_PARENT_PAID,
        format!(
            "{} parent group(s) have a Void/Adjust that reaches no Paid or original claim",
            affected.len()
        ),
        affected,
    )
}

/// A Void must point at a claim present in the run or at its own parent lineage.
pub fn validate_void_linkages(claims: &[Claim]) -> ValidationFinding {
    let known: HashSet<&str> = claims.iter().map(|c| c.claim_id.as_str()).collect();
    let affected: Vec<String> = claims
        .iter()
        .filter(|c| c.claim_type == ClaimType::Void)
        .filter(|c| {
            let link = c
                .void_claim_id
                .as_deref()
                .or(c.original_claim_id.as_deref())
                .map(str::trim)
                .filter(|l| !l.is_empty());
            match link {
                Some(link) => !known.contains(link) && link != c.parent_claim_id,
                None => true,
            }
        })
        .map(|c| c.claim_id.clone())
        .collect();
    if affected.is_empty() {
        return clear(Severity::Warning, rules::VOID_LINKAGE);
    }
    ValidationFinding::new(
        Severity::Warning,
        rules::VOID_LINKAGE,
        format!("{} Void claim(s) without a resolvable void link", affected.len()),
        affected,
    )
}

pub fn validate_slot_conflicts(groups: &BTreeMap<String, ParentClaimGroup>) -> ValidationFinding {
    let affected: Vec<String> = groups
        .values()
        .flat_map(|g| g.displaced.iter().map(|c| c.claim_id.clone()))
        .collect();
    if affected.is_empty() {
        return clear(Severity::Warning, rules::PARENT_SLOT_CONFLICT);
    }
    ValidationFinding::new(
        Severity::Warning,
        rules::PARENT_SLOT_CONFLICT,
        format!(
            "{} claim(s) displaced by an occupied parent slot and excluded from payment",
            affected.len()
        ),
        affected,
    )
}

pub fn frequency_distribution(claims: &[Claim]) -> ValidationFinding {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for claim in claims {
        let code = match claim.frequency() {
            Some(_) => claim.frequency_code.trim(),
            None => "invalid",
        };
        *counts.entry(code).or_default() += 1;
    }
    let summary = counts
        .iter()
        .map(|(code, n)| format!("{code}={n}"))
        .collect::<Vec<_>>()
        .join(", ");
    ValidationFinding::counted(
        Severity::Info,
        rules::FREQUENCY_DISTRIBUTION,
        format!("frequency codes: {summary}"),
        claims.len(),
        Vec::new(),
    )
}

/// Payment-center resolution outcome checked by final validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentCenterIntegrity {
    /// Keys that still have no id.
    pub unresolved_keys: Vec<String>,
    /// Parent groups that landed in the unresolved bucket.
    pub unresolved_groups: Vec<String>,
    pub failed_creations: Vec<String>,
    /// Parent groups whose slots resolve to different payees.
    pub payee_mismatches: Vec<String>,
}

impl PaymentCenterIntegrity {
    fn affected(&self) -> Vec<String> {
        self.unresolved_keys
            .iter()
            .chain(&self.unresolved_groups)
            .chain(&self.failed_creations)
            .chain(&self.payee_mismatches)
            .cloned()
            .collect()
    }
}

/// Parent groups whose populated slots derive different payment-center keys.
pub fn payee_mismatches(
    groups: &BTreeMap<String, ParentClaimGroup>,
    payee_type: PayeeType,
) -> Vec<String> {
    groups
        .values()
        .filter(|g| {
            let keys: BTreeSet<PaymentCenterKey> = g
                .slots()
                .filter_map(|c| PaymentCenterKey::from_claim(c, payee_type))
                .collect();
            keys.len() > 1
        })
        .map(|g| g.parent_id.clone())
        .collect()
}

/// Parent groups whose slots resolve to different payees. Known from the claims
/// alone, so it is checked before any payment center is looked up or created.
pub fn validate_payee_consistency(
    groups: &BTreeMap<String, ParentClaimGroup>,
    payee_type: PayeeType,
    mode: RunMode,
) -> ValidationFinding {
    let integrity = PaymentCenterIntegrity {
        payee_mismatches: payee_mismatches(groups, payee_type),
        ..PaymentCenterIntegrity::default()
    };
    validate_payment_centers(&integrity, mode)
}

/// Critical in Final Run; a Dry Run only reports it.
pub fn validate_payment_centers(integrity: &PaymentCenterIntegrity, mode: RunMode) -> ValidationFinding {
    let severity = if mode.is_final() {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let affected = integrity.affected();
    if affected.is_empty() {
        return clear(severity, rules::PAYMENT_CENTER_INTEGRITY);
    }
    ValidationFinding::new(
        severity,
        rules::PAYMENT_CENTER_INTEGRITY,
        format!(
            "{} unresolved key(s), {} unresolved group(s), {} failed creation(s), {} payee mismatch(es)",
            integrity.unresolved_keys.len(),
            integrity.unresolved_groups.len(),
            integrity.failed_creations.len(),
            integrity.payee_mismatches.len()
        ),
        affected,
    )
}

/// Counter movement of one sequence during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceUsage {
    pub counter: String,
    pub start: u64,
    pub reserved: u64,
    pub current: u64,
}

impl SequenceUsage {
    pub fn is_consistent(&self) -> bool {
        self.start.checked_add(self.reserved) == Some(self.current)
    }
}

pub fn validate_sequences(usage: &[SequenceUsage], mode: RunMode) -> ValidationFinding {
    if !mode.is_final() {
        return clear(Severity::Critical, rules::SEQUENCE_COUNTER);
    }
    let drifted: Vec<&SequenceUsage> = usage.iter().filter(|u| !u.is_consistent()).collect();
    if drifted.is_empty() {
        return clear(Severity::Critical, rules::SEQUENCE_COUNTER);
    }
    let detail = drifted
        .iter()
        .map(|u| {
            format!(
                "{}: expected {} found {}",
                u.counter,
                u.start.saturating_add(u.reserved),
                u.current
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    ValidationFinding::new(
        Severity::Critical,
        rules::SEQUENCE_COUNTER,
        format!("sequence counters moved unexpectedly ({detail})"),
        drifted.iter().map(|u| u.counter.clone()).collect(),
    )
}

/// Claim-level checks run before anything is resolved or written.
pub fn initial_findings(
    claims: &[Claim],
    groups: &BTreeMap<String, ParentClaimGroup>,
    event: &PaymentEvent,
    payee_type: PayeeType,
    mode: RunMode,
) -> Vec<ValidationFinding> {
    vec![
        validate_event_stage(event, mode),
        validate_frequency_codes(claims),
        validate_identifiers(claims, payee_type),
        validate_duplicates(claims),
        validate_benefit_plan(claims, &event.inclusion_criteria),
        validate_negative_dollars(claims),
        validate_missing_parent_paid(groups),
        validate_void_linkages(claims),
        validate_slot_conflicts(groups),
        validate_payee_consistency(groups, payee_type, mode),
        frequency_distribution(claims),
    ]
}

/// Drops clear findings, orders the rest by severity and flags Critical ones.
pub fn aggregate_findings(findings: Vec<ValidationFinding>) -> ValidationReport {
    let mut kept: Vec<ValidationFinding> = findings.into_iter().filter(|f| !f.is_clear()).collect();
    kept.sort_by(|a, b| a.severity.cmp(&b.severity));
    let blocked = kept.iter().any(|f| f.is_critical());
    ValidationReport {
        findings: kept,
        blocked,
    }
}

/// Findings per severity, keyed for the stats document.
pub fn severity_counts(report: &ValidationReport) -> HashMap<Severity, usize> {
    let mut counts = HashMap::new();
    for severity in [Severity::Critical, Severity::Warning, Severity::Info] {
        counts.insert(severity, report.count(severity));
    }
    counts
}
