use super::claim::Claim;
use super::event::PaymentEvent;
use super::over_under::OverUnderRecord;
use super::payment::{ClaimPayment, ServiceLinePayment};
use super::payment_center::{CreateAck, PaymentCenter, PaymentCenterId, PaymentCenterKey};
use super::sequence::SequenceChunk;
use super::stats::PaymentEventStats;
use crate::error::RepoResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Where claims are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimSource {
    /// The staged claims of the event being processed.
    WorkingSet,
    /// Claims already committed to production.
    Production,
}

/// Field projection for claim reads. Dry Run skips service-line detail it never uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimProjection {
    pub include_service_lines: bool,
}

/// Mutable production entity groups captured before a Final Run writes anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntitySet {
    PaymentCenters,
    OverUnder,
    Payments,
}

impl EntitySet {
    pub const MUTABLE: [EntitySet; 3] = [
        EntitySet::PaymentCenters,
        EntitySet::OverUnder,
        EntitySet::Payments,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub id: String,
    pub entity_sets: Vec<EntitySet>,
    pub records: usize,
}

impl fmt::Display for BackupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Per-record outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAck {
    Acknowledged(String),
    Failed { id: String, reason: String },
}

impl RecordAck {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, RecordAck::Acknowledged(_))
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Fails with `NotFound` for an unknown event.
    async fn load_payment_event(&self, event_id: &str) -> RepoResult<PaymentEvent>;
    async fn save_stats(&self, stats: &PaymentEventStats) -> RepoResult<()>;
}

#[async_trait]
pub trait ClaimRepository: Send + Sync {
    /// Lazily streams the claims of `event_id`.
    fn fetch_claims(
        &self,
        event_id: &str,
        source: ClaimSource,
        projection: Option<ClaimProjection>,
    ) -> BoxStream<'static, RepoResult<Claim>>;
}

#[async_trait]
pub trait PaymentCenterRepository: Send + Sync {
    /// Returns only the keys that exist.
    async fn lookup_payment_centers(
        &self,
        keys: &[PaymentCenterKey],
    ) -> RepoResult<HashMap<PaymentCenterKey, PaymentCenter>>;

    /// Unordered insert. A key that already exists is acknowledged with the stored center.
    async fn create_payment_centers(
        &self,
        centers: Vec<PaymentCenter>,
    ) -> RepoResult<Vec<CreateAck>>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Writes a batch of line payments, keyed by sequence id.
    async fn persist_service_line_payment(
        &self,
        payments: Vec<ServiceLinePayment>,
    ) -> RepoResult<Vec<RecordAck>>;

    /// Writes a batch of claim aggregates, keyed by (event, parent claim).
    async fn persist_claim_aggregate(
        &self,
        payments: Vec<ClaimPayment>,
    ) -> RepoResult<Vec<RecordAck>>;

    /// Ledger records of `centers` that did not originate from `event_id`.
    async fn fetch_prior_over_under(
        &self,
        centers: &[PaymentCenterId],
        event_id: &str,
    ) -> RepoResult<Vec<OverUnderRecord>>;

    /// Idempotent upsert keyed by (payment center, origin event, reference).
    async fn upsert_over_under(
        &self,
        event_id: &str,
        records: Vec<OverUnderRecord>,
    ) -> RepoResult<Vec<RecordAck>>;
}

#[async_trait]
pub trait BackupRepository: Send + Sync {
    async fn backup(&self, event_id: &str, entity_sets: &[EntitySet]) -> RepoResult<BackupRef>;
}

#[async_trait]
pub trait SequenceRepository: Send + Sync {
    /// Atomically reserves `[current, current + size)` and advances the counter.
    async fn reserve_sequence_chunk(&self, counter: &str, size: u64) -> RepoResult<SequenceChunk>;

    /// Next value the counter would issue.
    async fn current_sequence(&self, counter: &str) -> RepoResult<u64>;
}

pub type EventRepositoryRef = Arc<dyn EventRepository>;
pub type ClaimRepositoryRef = Arc<dyn ClaimRepository>;
pub type PaymentCenterRepositoryRef = Arc<dyn PaymentCenterRepository>;
pub type PaymentRepositoryRef = Arc<dyn PaymentRepository>;
pub type BackupRepositoryRef = Arc<dyn BackupRepository>;
pub type SequenceRepositoryRef = Arc<dyn SequenceRepository>;

/// Store handles for one run.
#[derive(Clone)]
pub struct Repositories {
    pub events: EventRepositoryRef,
    pub claims: ClaimRepositoryRef,
    pub payment_centers: PaymentCenterRepositoryRef,
    pub payments: PaymentRepositoryRef,
    pub backups: BackupRepositoryRef,
    pub sequences: SequenceRepositoryRef,
}

impl Repositories {
    /// Wires every port to one backend that implements them all.
    pub fn from_store<S>(store: S) -> Self
    where
        S: EventRepository
            + ClaimRepository
            + PaymentCenterRepository
            + PaymentRepository
            + BackupRepository
            + SequenceRepository
            + Clone
            + 'static,
    {
        Self {
            events: Arc::new(store.clone()),
            claims: Arc::new(store.clone()),
            payment_centers: Arc::new(store.clone()),
            payments: Arc::new(store.clone()),
            backups: Arc::new(store.clone()),
            sequences: Arc::new(store),
        }
    }
}
