use super::money::Money;
use super::payment_center::PaymentCenterId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `Over`: the payee was overpaid and owes the difference back.
/// `Under`: the payee was underpaid and is owed the difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OverUnderKind {
    Over,
    Under,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverUnderRecord {
    pub reference: String,
    pub payment_center_id: PaymentCenterId,
    /// Event whose run created the balance.
    pub origin_event_id: String,
    pub kind: OverUnderKind,
    pub total_amount: Money,
    pub remaining_amount: Money,
    #[serde(default)]
    pub applied_this_cycle: Money,
    /// Amount applied per consuming event. The source of truth for `remaining_amount`.
    #[serde(default)]
    pub applications: BTreeMap<String, Money>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub created_on: NaiveDate,
}

/// Upsert identity of a ledger record.
pub type OverUnderKey = (PaymentCenterId, String, String);

impl OverUnderRecord {
    pub fn new(
        payment_center_id: PaymentCenterId,
        origin_event_id: &str,
        kind: OverUnderKind,
        amount: Money,
        sources: Vec<String>,
        created_on: NaiveDate,
    ) -> Self {
        Self {
            reference: format!("{origin_event_id}:{payment_center_id}:{kind:?}"),
            payment_center_id,
            origin_event_id: origin_event_id.to_string(),
            kind,
            total_amount: amount,
            remaining_amount: amount,
            applied_this_cycle: Money::ZERO,
            applications: BTreeMap::new(),
            sources,
            created_on,
        }
    }

    pub fn key(&self) -> OverUnderKey {
        (
            self.payment_center_id,
            self.origin_event_id.clone(),
            self.reference.clone(),
        )
    }

    /// Total minus every recorded application.
    pub fn outstanding(&self) -> Money {
        self.total_amount - self.applications.values().sum::<Money>()
    }

    /// Balance outstanding when `event_id` starts, ignoring that event's own application.
    pub fn remaining_before(&self, event_id: &str) -> Money {
        let applied_elsewhere: Money = self
            .applications
            .iter()
            .filter(|(event, _)| event.as_str() != event_id)
            .map(|(_, amount)| *amount)
            .sum();
        self.total_amount - applied_elsewhere
    }

    /// Rebases the record to the start of `event_id`'s cycle.
    pub fn staged_for(&self, event_id: &str) -> Self {
        let mut staged = self.clone();
        staged.applications.remove(event_id);
        staged.remaining_amount = self.remaining_before(event_id);
        staged.applied_this_cycle = Money::ZERO;
        staged
    }
}

/// Carried Over/Under balances of one payment center at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OverUnderSummary {
    pub payment_center_id: PaymentCenterId,
    pub over_total: Money,
    pub under_total: Money,
    pub over_remaining: Money,
    pub under_remaining: Money,
    /// Oldest first.
    pub records: Vec<OverUnderRecord>,
}

impl OverUnderSummary {
    pub fn zero(payment_center_id: PaymentCenterId) -> Self {
        Self {
            payment_center_id,
            ..Default::default()
        }
    }

    pub fn from_records(payment_center_id: PaymentCenterId, mut records: Vec<OverUnderRecord>) -> Self {
        records.sort_by(|a, b| {
            a.created_on
                .cmp(&b.created_on)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        let mut summary = Self::zero(payment_center_id);
        for record in &records {
            match record.kind {
                OverUnderKind::Over => {
                    summary.over_total += record.total_amount;
                    summary.over_remaining += record.remaining_amount;
                }
                OverUnderKind::Under => {
                    summary.under_total += record.total_amount;
                    summary.under_remaining += record.remaining_amount;
                }
            }
        }
        summary.records = records;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn test_remaining_before_ignores_own_event() {
        let mut record = OverUnderRecord::new(
            PaymentCenterId(1),
            "PE-1",
            OverUnderKind::Over,
            Money::new(dec!(100)),
            vec![],
            date(1),
        );
        record.applications.insert("PE-2".into(), Money::new(dec!(30)));
        record.applications.insert("PE-3".into(), Money::new(dec!(20)));

        assert_eq!(record.remaining_before("PE-3"), Money::new(dec!(70)));
        assert_eq!(record.remaining_before("PE-4"), Money::new(dec!(50)));

        let staged = record.staged_for("PE-3");
        assert_eq!(staged.remaining_amount, Money::new(dec!(70)));
        assert!(!staged.applications.contains_key("PE-3"));
    }

    #[test]
    fn test_summary_orders_oldest_first() {
        let newer = OverUnderRecord::new(
            PaymentCenterId(1),
            "PE-2",
            OverUnderKind::Under,
            Money::new(dec!(5)),
            vec![],
            date(9),
        );
        let older = OverUnderRecord::new(
            PaymentCenterId(1),
            "PE-1",
            OverUnderKind::Over,
            Money::new(dec!(8)),
            vec![],
            date(2),
        );
        let summary = OverUnderSummary::from_records(PaymentCenterId(1), vec![newer, older]);
        assert_eq!(summary.records[0].origin_event_id, "PE-1");
        assert_eq!(summary.over_remaining, Money::new(dec!(8)));
        assert_eq!(summary.under_remaining, Money::new(dec!(5)));
    }
}
