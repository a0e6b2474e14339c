use super::money::Money;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClaimType {
    Paid,
    Void,
    Adjust,
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClaimStatus {
    Approved,
    Paid,
    Denied,
    Pended,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Institutional billing frequency codes (the third digit of the type of bill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrequencyCode {
    Original,
    InterimFirst,
    InterimContinuing,
    InterimLast,
    LateCharge,
    Replacement,
    Void,
}

impl FrequencyCode {
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(FrequencyCode::Original),
            "2" => Some(FrequencyCode::InterimFirst),
            "3" => Some(FrequencyCode::InterimContinuing),
            "4" => Some(FrequencyCode::InterimLast),
            "5" => Some(FrequencyCode::LateCharge),
            "7" => Some(FrequencyCode::Replacement),
            "8" => Some(FrequencyCode::Void),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub line1: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub line_number: u32,
    pub code: String,
    pub quantity: Decimal,
    pub billed_amount: Money,
    pub allowed_amount: Money,
}

impl ServiceLine {
    pub fn has_negative_amount(&self) -> bool {
        (self.quantity.is_sign_negative() && !self.quantity.is_zero())
            || self.billed_amount.is_negative()
            || self.allowed_amount.is_negative()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub parent_claim_id: String,
    #[serde(default)]
    pub original_claim_id: Option<String>,
    /// For a Void: the claim it reverses.
    #[serde(default)]
    pub void_claim_id: Option<String>,
    pub claim_type: ClaimType,
    pub status: ClaimStatus,
    /// Raw code as received; checked by validation, not by deserialization.
    pub frequency_code: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub npi: Option<String>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub payee_name: Option<String>,
    #[serde(default)]
    pub payee_address: Option<Address>,
    #[serde(default)]
    pub benefit_plan_id: Option<String>,
    #[serde(default)]
    pub service_lines: Vec<ServiceLine>,
}

impl Claim {
    pub fn frequency(&self) -> Option<FrequencyCode> {
        FrequencyCode::parse(&self.frequency_code)
    }
}

/// Claims sharing one parent lineage id, one slot per claim type.
///
/// Extra claims for an already occupied slot are kept in `displaced` so they
/// are never silently dropped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParentClaimGroup {
    pub parent_id: String,
    pub paid: Option<Claim>,
    pub void: Option<Claim>,
    pub adjust: Option<Claim>,
    pub displaced: Vec<Claim>,
    /// Void/Adjust present without a reachable Paid/Original claim.
    pub unresolved: bool,
}

impl ParentClaimGroup {
    pub fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, claim: Claim) {
        let slot = match claim.claim_type {
            ClaimType::Paid => &mut self.paid,
            ClaimType::Void => &mut self.void,
            ClaimType::Adjust => &mut self.adjust,
        };
        if slot.is_some() {
            self.displaced.push(claim);
        } else {
            *slot = Some(claim);
        }
    }

    /// Populated slots in rollup order: paid, adjust, void.
    pub fn slots(&self) -> impl Iterator<Item = &Claim> {
        [&self.paid, &self.adjust, &self.void]
            .into_iter()
            .filter_map(|slot| slot.as_ref())
    }

    /// Claim whose payee identity represents the group.
    pub fn representative(&self) -> Option<&Claim> {
        self.slots().next()
    }

    pub fn claim_ids(&self) -> Vec<String> {
        self.slots().map(|c| c.claim_id.clone()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::claim;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_group_slots_follow_rollup_order() {
        let mut group = ParentClaimGroup::new("P1");
        group.insert(claim("C3", "P1", ClaimType::Void, &[dec!(-130)]));
        group.insert(claim("C2", "P1", ClaimType::Adjust, &[dec!(-20)]));
        assert_eq!(group.representative().map(|c| c.claim_id.as_str()), Some("C2"));

        group.insert(claim("C1", "P1", ClaimType::Paid, &[dec!(100), dec!(50)]));
        assert_eq!(group.claim_ids(), vec!["C1", "C2", "C3"]);
        assert!(group.displaced.is_empty());
    }

    #[test]
    fn test_occupied_slot_displaces_claim() {
        let mut group = ParentClaimGroup::new("P1");
        group.insert(claim("C1", "P1", ClaimType::Paid, &[dec!(10)]));
        group.insert(claim("C1", "P1", ClaimType::Paid, &[dec!(10)]));
        assert_eq!(group.displaced.len(), 1);
        assert_eq!(group.claim_ids(), vec!["C1"]);
    }

    #[test]
    fn test_frequency_code_parsing() {
        assert_eq!(FrequencyCode::parse("1"), Some(FrequencyCode::Original));
        assert_eq!(FrequencyCode::parse(" 8 "), Some(FrequencyCode::Void));
        assert_eq!(FrequencyCode::parse("6"), None);
        assert_eq!(FrequencyCode::parse("X"), None);
    }
}
