use super::claim::ClaimStatus;
use super::money::Money;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Execution modes of a payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    Final,
}

impl RunMode {
    pub fn is_final(&self) -> bool {
        matches!(self, RunMode::Final)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::DryRun => write!(f, "dry-run"),
            RunMode::Final => write!(f, "final"),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dry-run" | "dryrun" | "dry" => Ok(RunMode::DryRun),
            "final" => Ok(RunMode::Final),
            other => Err(format!("unknown run mode `{other}`")),
        }
    }
}

/// Which kind of payee the event pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayeeType {
    Provider,
    Member,
}

impl FromStr for PayeeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provider" => Ok(PayeeType::Provider),
            "member" => Ok(PayeeType::Member),
            other => Err(format!("unknown payee type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStage {
    Draft,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DayCount {
    #[default]
    Actual365,
    Actual360,
}

impl DayCount {
    pub fn basis(&self) -> Decimal {
        match self {
            DayCount::Actual365 => Decimal::from(365),
            DayCount::Actual360 => Decimal::from(360),
        }
    }
}

/// Late-payment interest configuration of the business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestRules {
    /// Annual rate as a fraction (0.05 = 5%).
    pub rate: Decimal,
    #[serde(default)]
    pub grace_period_days: u32,
    #[serde(default)]
    pub day_count: DayCount,
    /// Whether Dry Run estimates include projected interest.
    #[serde(default)]
    pub project_in_dry_run: bool,
}

fn default_payable_statuses() -> BTreeSet<ClaimStatus> {
    BTreeSet::from([ClaimStatus::Approved])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InclusionCriteria {
    pub id: String,
    /// Empty means any plan is allowed.
    #[serde(default)]
    pub allowed_benefit_plans: BTreeSet<String>,
    #[serde(default = "default_payable_statuses")]
    pub payable_statuses: BTreeSet<ClaimStatus>,
}

impl InclusionCriteria {
    pub fn allows_plan(&self, plan: Option<&str>) -> bool {
        if self.allowed_benefit_plans.is_empty() {
            return true;
        }
        plan.is_some_and(|p| self.allowed_benefit_plans.contains(p))
    }
}

impl Default for InclusionCriteria {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            allowed_benefit_plans: BTreeSet::new(),
            payable_statuses: default_payable_statuses(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingSource {
    pub id: String,
    #[serde(default)]
    pub account_number: String,
    #[serde(default)]
    pub description: String,
}

fn default_factor() -> Decimal {
    Decimal::ONE
}

/// One configured processing cycle. Immutable once loaded for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub event_id: String,
    pub payee_type: PayeeType,
    pub due_date: NaiveDate,
    /// Date the payments are issued; interest accrues between due and payment date.
    pub payment_date: NaiveDate,
    pub stage: EventStage,
    #[serde(default)]
    pub inclusion_criteria: InclusionCriteria,
    pub funding_source: FundingSource,
    #[serde(default)]
    pub interest_rules: Option<InterestRules>,
    /// Share of the allowed amount that is paid.
    #[serde(default = "default_factor")]
    pub reimbursement_factor: Decimal,
    /// Positive payables below this amount are withheld and carried forward.
    #[serde(default)]
    pub minimum_disbursement: Money,
}
