use crate::domain::claim::{Claim, ParentClaimGroup};
use crate::domain::event::PayeeType;
use crate::domain::over_under::OverUnderSummary;
use crate::domain::payment_center::{
    PaymentCenter, PaymentCenterCache, PaymentCenterClaims, PaymentCenterId, PaymentCenterKey,
};
use crate::domain::ports::{ClaimProjection, ClaimRepositoryRef, ClaimSource};
use crate::error::{PaymentProcessError, Result};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parent groups whose payee could not be resolved. Carried to validation, never paid.
#[derive(Debug, Clone, Default)]
pub struct UnresolvedBucket {
    pub groups: BTreeMap<String, ParentClaimGroup>,
}

impl UnresolvedBucket {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn parent_ids(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    /// One unit per payment center, ordered by id.
    pub work: Vec<PaymentCenterClaims>,
    pub unresolved: UnresolvedBucket,
}

/// Drains the claim stream of `event_id` in `batch_size` chunks.
pub async fn fetch(
    repository: &ClaimRepositoryRef,
    event_id: &str,
    source: ClaimSource,
    projection: Option<ClaimProjection>,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Claim>> {
    let mut stream = repository
        .fetch_claims(event_id, source, projection)
        .ready_chunks(batch_size.max(1));
    let mut claims = Vec::new();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(PaymentProcessError::Cancelled);
        }
        for claim in chunk {
            claims.push(claim?);
        }
        debug!(fetched = claims.len(), "claim chunk received");
    }
    info!(event_id, claims = claims.len(), ?source, "claims fetched");
    Ok(claims)
}

/// Groups claims by parent lineage. Claims are placed in claim-id order so the
/// slot a duplicate lands in does not depend on read order.
///
/// A group without a Paid slot is `unresolved` unless one of its Void/Adjust
/// claims links, through its original or void claim id, to another claim of
/// the run.
pub fn group_by_parent(mut claims: Vec<Claim>) -> BTreeMap<String, ParentClaimGroup> {
    claims.sort_by(|a, b| a.claim_id.cmp(&b.claim_id));
    let known: HashSet<String> = claims.iter().map(|c| c.claim_id.clone()).collect();
    let mut groups: BTreeMap<String, ParentClaimGroup> = BTreeMap::new();
    for claim in claims {
        groups
            .entry(claim.parent_claim_id.clone())
            .or_insert_with(|| ParentClaimGroup::new(claim.parent_claim_id.clone()))
            .insert(claim);
    }
    for group in groups.values_mut() {
        let reaches_original = [&group.adjust, &group.void]
            .into_iter()
            .flatten()
            .any(|claim| links_to_known(claim, &known));
        group.unresolved =
            group.paid.is_none() && (group.void.is_some() || group.adjust.is_some()) && !reaches_original;
    }
    groups
}

fn links_to_known(claim: &Claim, known: &HashSet<String>) -> bool {
    [&claim.original_claim_id, &claim.void_claim_id]
        .into_iter()
        .flatten()
        .map(|link| link.trim())
        .any(|link| !link.is_empty() && link != claim.claim_id && known.contains(link))
}

/// Routes every parent group to its payment center.
///
/// Centers without a carried balance get a zero summary. Groups whose
/// representative has no cached key go to the unresolved bucket.
pub fn to_payment_center_claims(
    groups: BTreeMap<String, ParentClaimGroup>,
    cache: &PaymentCenterCache,
    payee_type: PayeeType,
    centers: &HashMap<PaymentCenterId, PaymentCenter>,
    summaries: &HashMap<PaymentCenterId, OverUnderSummary>,
) -> TransformOutput {
    let mut by_center: BTreeMap<PaymentCenterId, BTreeMap<String, ParentClaimGroup>> = BTreeMap::new();
    let mut unresolved = UnresolvedBucket::default();

    for (parent_id, group) in groups {
        let id = group
            .representative()
            .and_then(|c| PaymentCenterKey::from_claim(c, payee_type))
            .and_then(|key| cache.get(&key).copied());
        match id {
            Some(id) if centers.contains_key(&id) => {
                by_center.entry(id).or_default().insert(parent_id, group);
            }
            _ => {
                unresolved.groups.insert(parent_id, group);
            }
        }
    }

    let work: Vec<PaymentCenterClaims> = by_center
        .into_iter()
        .filter_map(|(id, groups)| {
            let center = centers.get(&id)?.clone();
            let over_under = summaries
                .get(&id)
                .cloned()
                .unwrap_or_else(|| OverUnderSummary::zero(id));
            Some(PaymentCenterClaims {
                center,
                over_under,
                groups,
            })
        })
        .collect();

    if !unresolved.is_empty() {
        warn!(groups = unresolved.groups.len(), "parent groups without a payment center");
    }
    info!(centers = work.len(), "claims transformed");
    TransformOutput { work, unresolved }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::claim::{ClaimType, fixtures::claim};
    use crate::infrastructure::in_memory::InMemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn center(id: u64, npi: &str) -> PaymentCenter {
        PaymentCenter::from_claim(
            PaymentCenterId(id),
            PaymentCenterKey::Provider {
                tax_id: "11-1111111".into(),
                npi: npi.into(),
            },
            None,
        )
    }

    #[test]
    fn test_group_by_parent_marks_orphans() {
        let mut linked = claim("C4", "P3", ClaimType::Void, &[dec!(-10)]);
        linked.void_claim_id = Some("C1".into());
        let mut dangling = claim("C5", "P4", ClaimType::Adjust, &[dec!(5)]);
        dangling.original_claim_id = Some("C404".into());
        let groups = group_by_parent(vec![
            claim("C2", "P1", ClaimType::Adjust, &[dec!(-20)]),
            claim("C1", "P1", ClaimType::Paid, &[dec!(150)]),
            claim("C3", "P2", ClaimType::Void, &[dec!(-10)]),
            linked,
            dangling,
        ]);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups["P1"].claim_ids(), vec!["C1", "C2"]);
        assert!(!groups["P1"].unresolved);
        assert!(groups["P2"].unresolved);
        assert!(!groups["P3"].unresolved);
        assert!(groups["P4"].unresolved);
    }

    #[test]
    fn test_routing_and_unresolved_bucket() {
        let mut stranger = claim("C9", "P9", ClaimType::Paid, &[dec!(5)]);
        stranger.npi = Some("555".into());
        let groups = group_by_parent(vec![claim("C1", "P1", ClaimType::Paid, &[dec!(10)]), stranger]);

        let known = center(1, "1234567890");
        let cache = Arc::new(HashMap::from([(known.key.clone(), known.id)]));
        let centers = HashMap::from([(known.id, known.clone())]);

        let output = to_payment_center_claims(groups, &cache, PayeeType::Provider, &centers, &HashMap::new());
        assert_eq!(output.work.len(), 1);
        assert_eq!(output.work[0].center.id, PaymentCenterId(1));
        assert_eq!(output.work[0].over_under, OverUnderSummary::zero(PaymentCenterId(1)));
        assert_eq!(output.unresolved.parent_ids(), vec!["P9"]);
    }

    #[tokio::test]
    async fn test_fetch_drains_stream_in_chunks() {
        let store = InMemoryStore::new();
        store
            .load_claims(
                "PE-1",
                (0..7)
                    .map(|i| claim(&format!("C{i}"), &format!("P{i}"), ClaimType::Paid, &[dec!(1)]))
                    .collect(),
            )
            .await;
        let repo: ClaimRepositoryRef = Arc::new(store);
        let claims = fetch(&repo, "PE-1", ClaimSource::WorkingSet, None, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(claims.len(), 7);
    }
}
