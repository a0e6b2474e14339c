use super::seed::{SEQUENCE_START, Seed};
use crate::domain::claim::Claim;
use crate::domain::event::PaymentEvent;
use crate::domain::over_under::{OverUnderKey, OverUnderRecord};
use crate::domain::payment::{ClaimPayment, ServiceLinePayment};
use crate::domain::payment_center::{CreateAck, PaymentCenter, PaymentCenterId, PaymentCenterKey};
use crate::domain::ports::{
    BackupRef, BackupRepository, ClaimProjection, ClaimRepository, ClaimSource, EntitySet,
    EventRepository, PaymentCenterRepository, PaymentRepository, RecordAck, SequenceRepository,
};
use crate::domain::sequence::SequenceChunk;
use crate::domain::stats::PaymentEventStats;
use crate::error::{RepoResult, RepositoryError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    payment_centers: Vec<PaymentCenter>,
    over_under: Vec<OverUnderRecord>,
    line_payments: Vec<ServiceLinePayment>,
    claim_payments: Vec<ClaimPayment>,
}

#[derive(Default)]
struct State {
    events: HashMap<String, PaymentEvent>,
    stats: HashMap<String, PaymentEventStats>,
    working_claims: HashMap<String, Vec<Claim>>,
    production_claims: HashMap<String, Vec<Claim>>,
    payment_centers: HashMap<PaymentCenterKey, PaymentCenter>,
    center_ids: HashMap<PaymentCenterId, PaymentCenterKey>,
    line_payments: BTreeMap<String, ServiceLinePayment>,
    claim_payments: BTreeMap<(String, String), ClaimPayment>,
    over_under: BTreeMap<OverUnderKey, OverUnderRecord>,
    sequences: HashMap<String, u64>,
    backups: Vec<(BackupRef, Snapshot)>,
}

/// A thread-safe in-memory store implementing every repository port.
///
/// Uses `Arc<RwLock<..>>` so clones share state; one clone can be handed to
/// each port. Payment-center creation checks and inserts under a single write
/// lock, which makes create-if-absent atomic across concurrent resolvers.
///
/// `production_writes` counts payment-center, payment and ledger writes, the
/// entities a Dry Run must never touch.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    production_writes: Arc<AtomicU64>,
    transient_failures: Arc<AtomicU32>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let mut state = State::default();
        state.events.insert(seed.event.event_id.clone(), seed.event);
        for center in seed.payment_centers {
            state.center_ids.insert(center.id, center.key.clone());
            state.payment_centers.insert(center.key.clone(), center);
        }
        for record in seed.over_under {
            state.over_under.insert(record.key(), record);
        }
        state.sequences.extend(seed.sequences);
        Self {
            state: Arc::new(RwLock::new(state)),
            ..Self::default()
        }
    }

    /// Makes the next `calls` port calls fail with a transient error.
    pub fn fail_next(&self, calls: u32) {
        self.transient_failures.store(calls, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> RepoResult<()> {
        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RepositoryError::Transient("injected failure".into()));
        }
        Ok(())
    }

    pub fn production_writes(&self) -> u64 {
        self.production_writes.load(Ordering::SeqCst)
    }

    fn count_write(&self, n: usize) {
        self.production_writes.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub async fn insert_event(&self, event: PaymentEvent) {
        let mut state = self.state.write().await;
        state.events.insert(event.event_id.clone(), event);
    }

    /// Loads the same claims into the working set and production for `event_id`.
    pub async fn load_claims(&self, event_id: &str, claims: Vec<Claim>) {
        let mut state = self.state.write().await;
        state.working_claims.insert(event_id.to_string(), claims.clone());
        state.production_claims.insert(event_id.to_string(), claims);
    }

    pub async fn insert_payment_center(&self, center: PaymentCenter) {
        let mut state = self.state.write().await;
        state.center_ids.insert(center.id, center.key.clone());
        state.payment_centers.insert(center.key.clone(), center);
    }

    pub async fn insert_over_under(&self, record: OverUnderRecord) {
        let mut state = self.state.write().await;
        state.over_under.insert(record.key(), record);
    }

    pub async fn set_sequence(&self, counter: &str, next: u64) {
        let mut state = self.state.write().await;
        state.sequences.insert(counter.to_string(), next);
    }

    pub async fn payment_center_count(&self) -> usize {
        self.state.read().await.payment_centers.len()
    }

    pub async fn payment_centers(&self) -> Vec<PaymentCenter> {
        let state = self.state.read().await;
        let mut centers: Vec<PaymentCenter> = state.payment_centers.values().cloned().collect();
        centers.sort_by_key(|c| c.id);
        centers
    }

    pub async fn over_under_records(&self) -> Vec<OverUnderRecord> {
        self.state.read().await.over_under.values().cloned().collect()
    }

    pub async fn line_payments(&self) -> Vec<ServiceLinePayment> {
        self.state.read().await.line_payments.values().cloned().collect()
    }

    pub async fn claim_payments(&self) -> Vec<ClaimPayment> {
        self.state.read().await.claim_payments.values().cloned().collect()
    }

    pub async fn saved_stats(&self, event_id: &str) -> Option<PaymentEventStats> {
        self.state.read().await.stats.get(event_id).cloned()
    }

    pub async fn backup_count(&self) -> usize {
        self.state.read().await.backups.len()
    }

    /// Record count of the most recent backup.
    pub async fn last_backup_records(&self) -> Option<usize> {
        self.state.read().await.backups.last().map(|(backup, _)| backup.records)
    }
}

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn load_payment_event(&self, event_id: &str) -> RepoResult<PaymentEvent> {
        self.injected_failure()?;
        let state = self.state.read().await;
        state
            .events
            .get(event_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("payment event {event_id}")))
    }

    async fn save_stats(&self, stats: &PaymentEventStats) -> RepoResult<()> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        state.stats.insert(stats.event_id.clone(), stats.clone());
        Ok(())
    }
}

#[async_trait]
impl ClaimRepository for InMemoryStore {
    fn fetch_claims(
        &self,
        event_id: &str,
        source: ClaimSource,
        projection: Option<ClaimProjection>,
    ) -> BoxStream<'static, RepoResult<Claim>> {
        if let Err(e) = self.injected_failure() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let state = self.state.clone();
        let event_id = event_id.to_string();
        stream::once(async move {
            let state = state.read().await;
            let claims = match source {
                ClaimSource::WorkingSet => state.working_claims.get(&event_id),
                ClaimSource::Production => state.production_claims.get(&event_id),
            };
            claims.cloned().unwrap_or_default()
        })
        .flat_map(move |claims| {
            stream::iter(claims.into_iter().map(move |mut claim| {
                if projection.is_some_and(|p| !p.include_service_lines) {
                    claim.service_lines.clear();
                }
                Ok(claim)
            }))
        })
        .boxed()
    }
}

#[async_trait]
impl PaymentCenterRepository for InMemoryStore {
    async fn lookup_payment_centers(
        &self,
        keys: &[PaymentCenterKey],
    ) -> RepoResult<HashMap<PaymentCenterKey, PaymentCenter>> {
        self.injected_failure()?;
        let state = self.state.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| state.payment_centers.get(k).map(|c| (k.clone(), c.clone())))
            .collect())
    }

    async fn create_payment_centers(&self, centers: Vec<PaymentCenter>) -> RepoResult<Vec<CreateAck>> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let mut acks = Vec::with_capacity(centers.len());
        for center in centers {
            if let Some(existing) = state.payment_centers.get(&center.key) {
                acks.push(CreateAck::AlreadyExists(existing.clone()));
                continue;
            }
            if let Some(owner) = state.center_ids.get(&center.id) {
                acks.push(CreateAck::Rejected {
                    reason: format!("id {} already belongs to {owner}", center.id),
                    key: center.key,
                });
                continue;
            }
            state.center_ids.insert(center.id, center.key.clone());
            state.payment_centers.insert(center.key.clone(), center.clone());
            self.count_write(1);
            acks.push(CreateAck::Created(center));
        }
        Ok(acks)
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn persist_service_line_payment(
        &self,
        payments: Vec<ServiceLinePayment>,
    ) -> RepoResult<Vec<RecordAck>> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        self.count_write(payments.len());
        Ok(payments
            .into_iter()
            .map(|payment| {
                let key = payment.record_key();
                state.line_payments.insert(key.clone(), payment);
                RecordAck::Acknowledged(key)
            })
            .collect())
    }

    async fn persist_claim_aggregate(&self, payments: Vec<ClaimPayment>) -> RepoResult<Vec<RecordAck>> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        self.count_write(payments.len());
        Ok(payments
            .into_iter()
            .map(|payment| {
                let key = (payment.event_id.clone(), payment.parent_claim_id.clone());
                let ack = RecordAck::Acknowledged(payment.parent_claim_id.clone());
                state.claim_payments.insert(key, payment);
                ack
            })
            .collect())
    }

    async fn fetch_prior_over_under(
        &self,
        centers: &[PaymentCenterId],
        event_id: &str,
    ) -> RepoResult<Vec<OverUnderRecord>> {
        self.injected_failure()?;
        let state = self.state.read().await;
        Ok(state
            .over_under
            .values()
            .filter(|r| centers.contains(&r.payment_center_id) && r.origin_event_id != event_id)
            .cloned()
            .collect())
    }

    async fn upsert_over_under(&self, _event_id: &str, records: Vec<OverUnderRecord>) -> RepoResult<Vec<RecordAck>> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        self.count_write(records.len());
        Ok(records
            .into_iter()
            .map(|record| {
                let ack = RecordAck::Acknowledged(record.reference.clone());
                state.over_under.insert(record.key(), record);
                ack
            })
            .collect())
    }
}

#[async_trait]
impl BackupRepository for InMemoryStore {
    async fn backup(&self, event_id: &str, entity_sets: &[EntitySet]) -> RepoResult<BackupRef> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let mut snapshot = Snapshot::default();
        for set in entity_sets {
            match set {
                EntitySet::PaymentCenters => {
                    snapshot.payment_centers = state.payment_centers.values().cloned().collect()
                }
                EntitySet::OverUnder => snapshot.over_under = state.over_under.values().cloned().collect(),
                EntitySet::Payments => {
                    snapshot.line_payments = state.line_payments.values().cloned().collect();
                    snapshot.claim_payments = state.claim_payments.values().cloned().collect();
                }
            }
        }
        let backup = BackupRef {
            id: format!("backup-{event_id}-{}", state.backups.len() + 1),
            entity_sets: entity_sets.to_vec(),
            records: snapshot.payment_centers.len()
                + snapshot.over_under.len()
                + snapshot.line_payments.len()
                + snapshot.claim_payments.len(),
        };
        state.backups.push((backup.clone(), snapshot));
        Ok(backup)
    }
}

#[async_trait]
impl SequenceRepository for InMemoryStore {
    async fn reserve_sequence_chunk(&self, counter: &str, size: u64) -> RepoResult<SequenceChunk> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let next = state.sequences.entry(counter.to_string()).or_insert(SEQUENCE_START);
        let start = *next;
        let end = start
            .checked_add(size)
            .ok_or_else(|| RepositoryError::SequenceExhausted(counter.to_string()))?;
        *next = end;
        Ok(SequenceChunk::new(counter, start, end))
    }

    async fn current_sequence(&self, counter: &str) -> RepoResult<u64> {
        self.injected_failure()?;
        let state = self.state.read().await;
        Ok(state.sequences.get(counter).copied().unwrap_or(SEQUENCE_START))
    }
}
