use crate::domain::event::PaymentEvent;
use crate::domain::over_under::OverUnderRecord;
use crate::domain::payment_center::PaymentCenter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Initial store contents: the event configuration plus existing production
/// payment centers, carried ledger balances and counter positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub event: PaymentEvent,
    #[serde(default)]
    pub payment_centers: Vec<PaymentCenter>,
    #[serde(default)]
    pub over_under: Vec<OverUnderRecord>,
    /// Next value per counter name.
    #[serde(default)]
    pub sequences: BTreeMap<String, u64>,
}

/// First value of a counter nobody has reserved from yet.
pub const SEQUENCE_START: u64 = 1;
