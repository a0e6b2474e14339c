use super::retry::RetryPolicy;
use super::sequence::{PAYMENT_CENTER_COUNTER, SequenceAllocator};
use crate::domain::claim::Claim;
use crate::domain::event::PayeeType;
use crate::domain::payment_center::{
    CreateAck, CreatedReport, EntryTag, PaymentCenter, PaymentCenterCache, PaymentCenterId,
    PaymentCenterKey, WorkingPaymentCenterEntry,
};
use crate::domain::ports::PaymentCenterRepositoryRef;
use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First provisional id handed to Dry Run `New` entries. The production
/// counter never reaches this range.
pub const PROVISIONAL_ID_BASE: u64 = 900_000_000_000;

/// Split of the derived keys into known and unknown payees.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub existing: HashMap<PaymentCenterKey, PaymentCenter>,
    pub missing: BTreeSet<PaymentCenterKey>,
}

/// Maps payee identities to payment-center ids, creating the ones that do not exist yet.
pub struct PaymentCenterResolver {
    repository: PaymentCenterRepositoryRef,
    retry: RetryPolicy,
    cancel: CancellationToken,
    lookup_batch: usize,
}

impl PaymentCenterResolver {
    pub fn new(
        repository: PaymentCenterRepositoryRef,
        retry: RetryPolicy,
        cancel: CancellationToken,
        lookup_batch: usize,
    ) -> Self {
        Self {
            repository,
            retry,
            cancel,
            lookup_batch: lookup_batch.max(1),
        }
    }

    pub fn derive_keys(claims: &[Claim], payee_type: PayeeType) -> BTreeSet<PaymentCenterKey> {
        claims
            .iter()
            .filter_map(|c| PaymentCenterKey::from_claim(c, payee_type))
            .collect()
    }

    /// New-center templates per key, named after the lowest claim id carrying the key.
    pub fn templates(claims: &[Claim], payee_type: PayeeType) -> BTreeMap<PaymentCenterKey, PaymentCenter> {
        let mut exemplars: BTreeMap<PaymentCenterKey, &Claim> = BTreeMap::new();
        for claim in claims {
            let Some(key) = PaymentCenterKey::from_claim(claim, payee_type) else {
                continue;
            };
            exemplars
                .entry(key)
                .and_modify(|current| {
                    if claim.claim_id < current.claim_id {
                        *current = claim;
                    }
                })
                .or_insert(claim);
        }
        exemplars
            .into_iter()
            .map(|(key, claim)| {
                let center = PaymentCenter::from_claim(PaymentCenterId::default(), key.clone(), Some(claim));
                (key, center)
            })
            .collect()
    }

    async fn lookup(&self, keys: &[PaymentCenterKey]) -> Result<HashMap<PaymentCenterKey, PaymentCenter>> {
        let mut found = HashMap::new();
        for batch in keys.chunks(self.lookup_batch) {
            let repository = self.repository.clone();
            let page = self
                .retry
                .execute(
                    || {
                        let repository = repository.clone();
                        async move { repository.lookup_payment_centers(batch).await }
                    },
                    "lookup_payment_centers",
                    &self.cancel,
                )
                .await?;
            found.extend(page);
        }
        Ok(found)
    }

    pub async fn resolve(&self, keys: &BTreeSet<PaymentCenterKey>) -> Result<Resolution> {
        let ordered: Vec<PaymentCenterKey> = keys.iter().cloned().collect();
        let existing = self.lookup(&ordered).await?;
        let missing = keys
            .iter()
            .filter(|k| !existing.contains_key(*k))
            .cloned()
            .collect::<BTreeSet<_>>();
        info!(
            existing = existing.len(),
            missing = missing.len(),
            "resolved payment center keys"
        );
        Ok(Resolution { existing, missing })
    }

    /// Dry Run shadow: existing centers as `Old`, missing ones as `New` with
    /// provisional ids assigned in key order.
    pub fn working_entries(
        resolution: &Resolution,
        templates: &BTreeMap<PaymentCenterKey, PaymentCenter>,
    ) -> Vec<WorkingPaymentCenterEntry> {
        let mut entries: Vec<WorkingPaymentCenterEntry> = resolution
            .existing
            .values()
            .cloned()
            .map(|center| WorkingPaymentCenterEntry {
                tag: EntryTag::Old,
                center,
            })
            .collect();
        entries.sort_by(|a, b| a.center.key.cmp(&b.center.key));

        for (offset, key) in resolution.missing.iter().enumerate() {
            let id = PaymentCenterId(PROVISIONAL_ID_BASE + offset as u64);
            entries.push(WorkingPaymentCenterEntry {
                tag: EntryTag::New,
                center: new_center(id, key, templates),
            });
        }
        entries
    }

    /// Final Run: reserves production ids for the missing keys without writing the centers.
    pub async fn stage_missing(
        &self,
        missing: &BTreeSet<PaymentCenterKey>,
        templates: &BTreeMap<PaymentCenterKey, PaymentCenter>,
        allocator: &SequenceAllocator,
    ) -> Result<Vec<WorkingPaymentCenterEntry>> {
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        let mut chunk = allocator
            .allocate(PAYMENT_CENTER_COUNTER, missing.len() as u64)
            .await?;
        let mut staged = Vec::with_capacity(missing.len());
        for key in missing {
            let Some(id) = chunk.next_id() else {
                break;
            };
            staged.push(WorkingPaymentCenterEntry {
                tag: EntryTag::New,
                center: new_center(PaymentCenterId(id), key, templates),
            });
        }
        debug!(staged = staged.len(), "staged new payment centers");
        Ok(staged)
    }

    /// Read-verify-create: re-looks up the staged keys, then inserts the rest.
    ///
    /// A key another resolver created in the meantime counts as resolved and
    /// its stored center is adopted.
    pub async fn commit_staged(&self, staged: Vec<PaymentCenter>) -> Result<CreatedReport> {
        let mut report = CreatedReport::default();
        if staged.is_empty() {
            return Ok(report);
        }

        let keys: Vec<PaymentCenterKey> = staged.iter().map(|c| c.key.clone()).collect();
        let mut already = self.lookup(&keys).await?;
        let to_create: Vec<PaymentCenter> = staged
            .into_iter()
            .filter(|c| match already.remove(&c.key) {
                Some(existing) => {
                    report.already_existed.push(existing);
                    false
                }
                None => true,
            })
            .collect();

        if !to_create.is_empty() {
            let repository = self.repository.clone();
            let acks = self
                .retry
                .execute(
                    || {
                        let repository = repository.clone();
                        let batch = to_create.clone();
                        async move { repository.create_payment_centers(batch).await }
                    },
                    "create_payment_centers",
                    &self.cancel,
                )
                .await?;
            for ack in acks {
                match ack {
                    CreateAck::Created(center) => report.created.push(center),
                    CreateAck::AlreadyExists(center) => report.already_existed.push(center),
                    CreateAck::Rejected { key, reason } => {
                        warn!(%key, %reason, "payment center creation rejected");
                        report.failed.push((key, reason));
                    }
                }
            }
        }

        info!(
            created = report.created.len(),
            already_existed = report.already_existed.len(),
            failed = report.failed.len(),
            "committed payment centers"
        );
        Ok(report)
    }

    /// Stages and commits in one step.
    pub async fn create_missing(
        &self,
        missing: &BTreeSet<PaymentCenterKey>,
        templates: &BTreeMap<PaymentCenterKey, PaymentCenter>,
        allocator: &SequenceAllocator,
    ) -> Result<CreatedReport> {
        let staged = self.stage_missing(missing, templates, allocator).await?;
        self.commit_staged(staged.into_iter().map(|e| e.center).collect())
            .await
    }

    pub fn build_cache<'a>(centers: impl IntoIterator<Item = &'a PaymentCenter>) -> PaymentCenterCache {
        Arc::new(
            centers
                .into_iter()
                .map(|c| (c.key.clone(), c.id))
                .collect::<HashMap<_, _>>(),
        )
    }
}

fn new_center(
    id: PaymentCenterId,
    key: &PaymentCenterKey,
    templates: &BTreeMap<PaymentCenterKey, PaymentCenter>,
) -> PaymentCenter {
    match templates.get(key) {
        Some(template) => PaymentCenter {
            id,
            ..template.clone()
        },
        None => PaymentCenter::from_claim(id, key.clone(), None),
    }
}

/// Staged ids that must be rewritten because another creator won the key.
pub fn id_remap(staged: &[PaymentCenter], report: &CreatedReport) -> HashMap<PaymentCenterId, PaymentCenterId> {
    let winners: HashMap<&PaymentCenterKey, PaymentCenterId> = report
        .already_existed
        .iter()
        .map(|c| (&c.key, c.id))
        .collect();
    staged
        .iter()
        .filter_map(|c| match winners.get(&c.key) {
            Some(winner) if *winner != c.id => Some((c.id, *winner)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::RetryConfig;
    use crate::domain::claim::{ClaimType, fixtures::claim};
    use crate::infrastructure::in_memory::InMemoryStore;
    use rust_decimal_macros::dec;

    fn key(npi: &str) -> PaymentCenterKey {
        PaymentCenterKey::Provider {
            tax_id: "11-1111111".into(),
            npi: npi.into(),
        }
    }

    fn resolver(store: &InMemoryStore) -> PaymentCenterResolver {
        PaymentCenterResolver::new(
            Arc::new(store.clone()),
            RetryPolicy::new(RetryConfig::default()),
            CancellationToken::new(),
            2,
        )
    }

    fn allocator(store: &InMemoryStore) -> SequenceAllocator {
        SequenceAllocator::new(
            Arc::new(store.clone()),
            RetryPolicy::with_defaults(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_derive_keys_skips_missing_identifiers() {
        let mut anonymous = claim("C3", "P3", ClaimType::Paid, &[dec!(1)]);
        anonymous.tax_id = None;
        let mut other = claim("C2", "P2", ClaimType::Paid, &[dec!(1)]);
        other.npi = Some("999".into());
        let claims = vec![claim("C1", "P1", ClaimType::Paid, &[dec!(1)]), other, anonymous];

        let keys = PaymentCenterResolver::derive_keys(&claims, PayeeType::Provider);
        assert_eq!(keys.len(), 2);
        let templates = PaymentCenterResolver::templates(&claims, PayeeType::Provider);
        assert_eq!(templates[&key("999")].name, "Clinic One");
    }

    #[tokio::test]
    async fn test_dry_run_entries_are_deterministic() {
        let store = InMemoryStore::new();
        store
            .insert_payment_center(PaymentCenter::from_claim(PaymentCenterId(5), key("1"), None))
            .await;
        let keys = BTreeSet::from([key("1"), key("3"), key("2")]);

        let resolution = resolver(&store).resolve(&keys).await.unwrap();
        assert_eq!(resolution.missing.len(), 2);
        let entries = PaymentCenterResolver::working_entries(&resolution, &BTreeMap::new());
        let new: Vec<(PaymentCenterKey, u64)> = entries
            .iter()
            .filter(|e| e.tag == EntryTag::New)
            .map(|e| (e.center.key.clone(), e.center.id.0))
            .collect();
        assert_eq!(
            new,
            vec![(key("2"), PROVISIONAL_ID_BASE), (key("3"), PROVISIONAL_ID_BASE + 1)]
        );
        assert_eq!(store.production_writes(), 0);
    }

    #[tokio::test]
    async fn test_create_missing_uses_counter_ids() {
        let store = InMemoryStore::new();
        store.set_sequence(PAYMENT_CENTER_COUNTER, 100).await;
        let missing = BTreeSet::from([key("1"), key("2")]);

        let report = resolver(&store)
            .create_missing(&missing, &BTreeMap::new(), &allocator(&store))
            .await
            .unwrap();
        let ids: Vec<u64> = report.created.iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![100, 101]);

        let cache = PaymentCenterResolver::build_cache(report.resolved());
        assert_eq!(cache[&key("2")], PaymentCenterId(101));
    }

    #[tokio::test]
    async fn test_concurrent_creators_agree_on_one_center() {
        let store = InMemoryStore::new();
        let missing = BTreeSet::from([key("7")]);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let missing = missing.clone();
            handles.push(tokio::spawn(async move {
                let report = resolver(&store)
                    .create_missing(&missing, &BTreeMap::new(), &allocator(&store))
                    .await
                    .unwrap();
                PaymentCenterResolver::build_cache(report.resolved())[&key("7")]
            }));
        }
        let mut seen = BTreeSet::new();
        for handle in handles {
            seen.insert(handle.await.unwrap());
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(store.payment_center_count().await, 1);
    }

    #[test]
    fn test_id_remap_points_losers_at_winner() {
        let staged = vec![
            PaymentCenter::from_claim(PaymentCenterId(10), key("1"), None),
            PaymentCenter::from_claim(PaymentCenterId(11), key("2"), None),
        ];
        let report = CreatedReport {
            created: vec![staged[1].clone()],
            already_existed: vec![PaymentCenter::from_claim(PaymentCenterId(3), key("1"), None)],
            failed: vec![],
        };
        let remap = id_remap(&staged, &report);
        assert_eq!(remap.len(), 1);
        assert_eq!(remap[&PaymentCenterId(10)], PaymentCenterId(3));
    }
}
