use super::claim::{ClaimType, ServiceLine};
use super::money::Money;
use super::payment_center::PaymentCenterId;
use serde::{Deserialize, Serialize};

/// Computed payment for one service line. Unsigned; the slot sign is applied at rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLinePayment {
    pub sequence_id: u64,
    pub event_id: String,
    pub payment_center_id: PaymentCenterId,
    pub parent_claim_id: String,
    pub claim_id: String,
    pub claim_type: ClaimType,
    pub line: ServiceLine,
    pub paid_amount: Money,
}

impl ServiceLinePayment {
    /// Storage identity of a line within its event. A rerun of the event
    /// overwrites the line instead of adding another one.
    pub fn record_key(&self) -> String {
        format!("{}/{}/{:010}", self.event_id, self.claim_id, self.line.line_number)
    }

    /// Copy with money rounded to cents, as written to storage.
    pub fn rounded(&self) -> Self {
        let mut out = self.clone();
        out.paid_amount = self.paid_amount.round_cents();
        out
    }
}

/// Claim-level aggregate of a parent group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimPayment {
    pub event_id: String,
    pub payment_center_id: PaymentCenterId,
    pub parent_claim_id: String,
    pub claim_ids: Vec<String>,
    pub paid_total: Money,
    pub adjust_total: Money,
    /// Stored as a non-positive amount.
    pub void_total: Money,
    pub interest_amount: Money,
    pub total_amount: Money,
    pub service_lines: Vec<ServiceLinePayment>,
}

impl ClaimPayment {
    pub fn rounded(&self) -> Self {
        let mut out = self.clone();
        out.paid_total = self.paid_total.round_cents();
        out.adjust_total = self.adjust_total.round_cents();
        out.void_total = self.void_total.round_cents();
        out.interest_amount = self.interest_amount.round_cents();
        out.total_amount = self.total_amount.round_cents();
        out.service_lines = self.service_lines.iter().map(|l| l.rounded()).collect();
        out
    }
}

/// Dry Run estimate: one amount per parent group, no line detail.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimLevelEstimate {
    pub parent_claim_id: String,
    pub payment_center_id: PaymentCenterId,
    pub amount: Money,
    pub projected_interest: Money,
}

impl ClaimLevelEstimate {
    pub fn total(&self) -> Money {
        self.amount + self.projected_interest
    }
}
