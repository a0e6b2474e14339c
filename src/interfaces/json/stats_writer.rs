use crate::application::validation::severity_counts;
use crate::domain::claim::{ClaimStatus, ClaimType};
use crate::domain::event::RunMode;
use crate::domain::stats::{PaymentEventStats, PhaseTiming, RunStatus, Severity, ValidationReport};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

/// Money as a JSON number, rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Amount(#[serde(with = "rust_decimal::serde::float")] pub Decimal);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsDocument {
    pub overall: Amount,
    pub by_payment_center: BTreeMap<String, Amount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FindingCounts {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
}

/// The externally visible shape of a run's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsDocument {
    pub event_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub totals: TotalsDocument,
    pub claim_counts: BTreeMap<ClaimType, u64>,
    pub claim_status_counts: BTreeMap<ClaimStatus, u64>,
    pub findings: FindingCounts,
    pub report: ValidationReport,
    pub production_mutated: bool,
    pub backup_ref: Option<String>,
    pub created_payment_centers: usize,
    pub unresolved_claims: usize,
    pub timings: Vec<PhaseTiming>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl From<&PaymentEventStats> for StatsDocument {
    fn from(stats: &PaymentEventStats) -> Self {
        let totals = stats.totals.rounded();
        let counts = severity_counts(&stats.report);
        let count = |severity: Severity| counts.get(&severity).copied().unwrap_or_default();
        Self {
            event_id: stats.event_id.clone(),
            mode: stats.mode,
            status: stats.status(),
            totals: TotalsDocument {
                overall: Amount(totals.overall.value()),
                by_payment_center: totals
                    .by_payment_center
                    .iter()
                    .map(|(id, amount)| (id.to_string(), Amount(amount.value())))
                    .collect(),
            },
            claim_counts: stats.claim_counts.clone(),
            claim_status_counts: stats.claim_status_counts.clone(),
            findings: FindingCounts {
                critical: count(Severity::Critical),
                warning: count(Severity::Warning),
                info: count(Severity::Info),
            },
            report: stats.report.clone(),
            production_mutated: stats.production_mutated,
            backup_ref: stats.backup_ref.clone(),
            created_payment_centers: stats.created_payment_centers,
            unresolved_claims: stats.unresolved_claims,
            timings: stats.timings.clone(),
            started_at: stats.started_at,
            completed_at: stats.completed_at,
            failure: stats.failure.clone(),
        }
    }
}

/// Writes stats documents as pretty-printed JSON.
pub struct StatsWriter<W: Write> {
    writer: W,
}

impl<W: Write> StatsWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_stats(&mut self, stats: &PaymentEventStats) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, &StatsDocument::from(stats))?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}
