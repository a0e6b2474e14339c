use super::claim::{Address, Claim, ParentClaimGroup};
use super::event::PayeeType;
use super::over_under::OverUnderSummary;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentCenterId(pub u64);

impl fmt::Display for PaymentCenterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a payee as derived from claim data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PaymentCenterKey {
    Provider { tax_id: String, npi: String },
    Member { member_id: String },
}

impl PaymentCenterKey {
    /// Derives the key for `payee_type`, or `None` when a required identifier is missing.
    pub fn from_claim(claim: &Claim, payee_type: PayeeType) -> Option<Self> {
        fn present(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        match payee_type {
            PayeeType::Provider => Some(PaymentCenterKey::Provider {
                tax_id: present(&claim.tax_id)?,
                npi: present(&claim.npi)?,
            }),
            PayeeType::Member => Some(PaymentCenterKey::Member {
                member_id: present(&claim.member_id)?,
            }),
        }
    }
}

impl fmt::Display for PaymentCenterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentCenterKey::Provider { tax_id, npi } => write!(f, "P:{tax_id}:{npi}"),
            PaymentCenterKey::Member { member_id } => write!(f, "M:{member_id}"),
        }
    }
}

/// A payee. Created once per unique key and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCenter {
    pub id: PaymentCenterId,
    pub key: PaymentCenterKey,
    pub name: String,
    #[serde(default)]
    pub address: Option<Address>,
}

impl PaymentCenter {
    pub fn from_claim(id: PaymentCenterId, key: PaymentCenterKey, claim: Option<&Claim>) -> Self {
        let name = claim
            .and_then(|c| c.payee_name.clone())
            .unwrap_or_else(|| key.to_string());
        Self {
            id,
            key,
            name,
            address: claim.and_then(|c| c.payee_address.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryTag {
    Old,
    New,
}

/// Shadow copy of a payment center used while a run is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingPaymentCenterEntry {
    pub tag: EntryTag,
    pub center: PaymentCenter,
}

/// Read-only identity lookup shared by every task after resolution.
pub type PaymentCenterCache = Arc<HashMap<PaymentCenterKey, PaymentCenterId>>;

/// Per-record acknowledgement of a payment-center insert.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateAck {
    Created(PaymentCenter),
    AlreadyExists(PaymentCenter),
    Rejected {
        key: PaymentCenterKey,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatedReport {
    pub created: Vec<PaymentCenter>,
    /// Keys another resolver created first; the existing center is adopted.
    pub already_existed: Vec<PaymentCenter>,
    pub failed: Vec<(PaymentCenterKey, String)>,
}

impl CreatedReport {
    pub fn resolved(&self) -> impl Iterator<Item = &PaymentCenter> {
        self.created.iter().chain(self.already_existed.iter())
    }
}

/// The unit of work for one payee: snapshot, carried balances and claim groups.
#[derive(Debug, Clone)]
pub struct PaymentCenterClaims {
    pub center: PaymentCenter,
    pub over_under: OverUnderSummary,
    pub groups: BTreeMap<String, ParentClaimGroup>,
}

impl PaymentCenterClaims {
    pub fn claim_count(&self) -> usize {
        self.groups.values().map(|g| g.slots().count()).sum()
    }
}
