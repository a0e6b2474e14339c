use super::claim::{ClaimStatus, ClaimType};
use super::event::RunMode;
use super::money::Money;
use super::payment_center::PaymentCenterId;
use crate::error::{PaymentProcessError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

pub const MAX_SAMPLE_IDS: usize = 5;

/// Outcome of one validation rule. Data, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFinding {
    pub severity: Severity,
    pub rule_id: String,
    pub message: String,
    pub count: usize,
    pub sample_ids: Vec<String>,
}

impl ValidationFinding {
    pub fn new(
        severity: Severity,
        rule_id: &str,
        message: impl Into<String>,
        affected: Vec<String>,
    ) -> Self {
        let count = affected.len();
        let sample_ids = affected.into_iter().take(MAX_SAMPLE_IDS).collect();
        Self {
            severity,
            rule_id: rule_id.to_string(),
            message: message.into(),
            count,
            sample_ids,
        }
    }

    /// Finding whose count differs from the number of distinct sample ids.
    pub fn counted(
        severity: Severity,
        rule_id: &str,
        message: impl Into<String>,
        count: usize,
        samples: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            severity,
            rule_id: rule_id.to_string(),
            message: message.into(),
            count,
            sample_ids: samples.into_iter().take(MAX_SAMPLE_IDS).collect(),
        }
    }

    /// A rule that found nothing.
    pub fn is_clear(&self) -> bool {
        self.count == 0
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical && !self.is_clear()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<ValidationFinding>,
    pub blocked: bool,
}

impl ValidationReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.blocked |= other.blocked;
        self.findings.extend(other.findings);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Started,
    Validating,
    Calculating,
    Completed,
    Blocked,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Blocked | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub overall: Money,
    pub by_payment_center: BTreeMap<PaymentCenterId, Money>,
}

impl Totals {
    pub fn add(&mut self, center: PaymentCenterId, amount: Money) {
        *self.by_payment_center.entry(center).or_default() += amount;
        self.overall += amount;
    }

    /// Rounded copy for reporting. Each figure is rounded once from its exact value.
    pub fn rounded(&self) -> Self {
        Self {
            overall: self.overall.round_cents(),
            by_payment_center: self
                .by_payment_center
                .iter()
                .map(|(id, amount)| (*id, amount.round_cents()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub millis: u128,
}

/// Run-scoped aggregate. Only the orchestrator writes it, and only until the
/// status is terminal; everything outside the crate reads it through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEventStats {
    pub(crate) event_id: String,
    pub(crate) mode: RunMode,
    status: RunStatus,
    pub(crate) totals: Totals,
    pub(crate) claim_counts: BTreeMap<ClaimType, u64>,
    pub(crate) claim_status_counts: BTreeMap<ClaimStatus, u64>,
    pub(crate) report: ValidationReport,
    pub(crate) timings: Vec<PhaseTiming>,
    pub(crate) production_mutated: bool,
    pub(crate) backup_ref: Option<String>,
    pub(crate) created_payment_centers: usize,
    pub(crate) unresolved_claims: usize,
    pub(crate) failure: Option<String>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
}

impl PaymentEventStats {
    pub fn start(event_id: &str, mode: RunMode) -> Self {
        Self {
            event_id: event_id.to_string(),
            mode,
            status: RunStatus::Started,
            totals: Totals::default(),
            claim_counts: BTreeMap::new(),
            claim_status_counts: BTreeMap::new(),
            report: ValidationReport::default(),
            timings: Vec::new(),
            production_mutated: false,
            backup_ref: None,
            created_payment_centers: 0,
            unresolved_claims: 0,
            failure: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Exact totals; the stats document rounds them.
    pub fn totals(&self) -> &Totals {
        &self.totals
    }

    pub fn claim_counts(&self) -> &BTreeMap<ClaimType, u64> {
        &self.claim_counts
    }

    pub fn claim_status_counts(&self) -> &BTreeMap<ClaimStatus, u64> {
        &self.claim_status_counts
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn timings(&self) -> &[PhaseTiming] {
        &self.timings
    }

    pub fn production_mutated(&self) -> bool {
        self.production_mutated
    }

    pub fn backup_ref(&self) -> Option<&str> {
        self.backup_ref.as_deref()
    }

    pub fn created_payment_centers(&self) -> usize {
        self.created_payment_centers
    }

    pub fn unresolved_claims(&self) -> usize {
        self.unresolved_claims
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn set_status(&mut self, status: RunStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(PaymentProcessError::ProcessingState {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(PaymentProcessError::ProcessingState {
                from: self.status.to_string(),
                to: "update".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_finding_keeps_five_samples() {
        let affected: Vec<String> = (0..8).map(|i| format!("C{i}")).collect();
        let finding = ValidationFinding::new(Severity::Warning, "rule", "msg", affected);
        assert_eq!(finding.count, 8);
        assert_eq!(finding.sample_ids.len(), MAX_SAMPLE_IDS);
        assert!(!finding.is_critical());
    }

    #[test]
    fn test_stats_freeze_after_terminal_status() {
        let mut stats = PaymentEventStats::start("PE-1", RunMode::DryRun);
        stats.set_status(RunStatus::Validating).unwrap();
        stats.set_status(RunStatus::Completed).unwrap();
        assert!(stats.completed_at.is_some());
        assert!(matches!(
            stats.set_status(RunStatus::Failed),
            Err(PaymentProcessError::ProcessingState { .. })
        ));
        assert!(stats.ensure_mutable().is_err());
    }

    #[test]
    fn test_fresh_stats_read_through_accessors() {
        let stats = PaymentEventStats::start("PE-9", RunMode::Final);
        assert_eq!(stats.event_id(), "PE-9");
        assert_eq!(stats.mode(), RunMode::Final);
        assert_eq!(stats.status(), RunStatus::Started);
        assert!(!stats.production_mutated());
        assert_eq!(stats.backup_ref(), None);
        assert_eq!(stats.failure(), None);
        assert_eq!(stats.completed_at(), None);
        assert!(stats.report().findings.is_empty());
    }

    #[test]
    fn test_totals_round_per_figure() {
        let mut totals = Totals::default();
        totals.add(PaymentCenterId(1), Money::new(dec!(0.005)));
        totals.add(PaymentCenterId(2), Money::new(dec!(0.005)));
        let rounded = totals.rounded();
        assert_eq!(rounded.overall, Money::new(dec!(0.01)));
        assert_eq!(rounded.by_payment_center[&PaymentCenterId(1)], Money::new(dec!(0.01)));
    }
}
