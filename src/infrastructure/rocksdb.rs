use super::seed::{SEQUENCE_START, Seed};
use crate::domain::claim::Claim;
use crate::domain::event::PaymentEvent;
use crate::domain::over_under::OverUnderRecord;
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
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Payment event configurations keyed by event id.
pub const CF_EVENTS: &str = "events";
/// Run statistics keyed by event id.
pub const CF_STATS: &str = "stats";
/// Claims keyed by `{event}/{W|P}/{claim_id}`.
pub const CF_CLAIMS: &str = "claims";
/// Payment centers keyed by their identity key.
pub const CF_PAYMENT_CENTERS: &str = "payment_centers";
/// Reverse index from payment-center id to identity key.
pub const CF_PAYMENT_CENTER_IDS: &str = "payment_center_ids";
/// Line payments (`L/{event}/{claim}/{line}`) and claim aggregates (`C/{event}/{parent}`).
pub const CF_PAYMENTS: &str = "payments";
/// Over/under ledger keyed by `{center}/{origin_event}/{reference}`.
pub const CF_OVER_UNDER: &str = "over_under";
/// Next value per counter name.
pub const CF_SEQUENCES: &str = "sequences";
/// Pre-write snapshots keyed by backup id.
pub const CF_BACKUPS: &str = "backups";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_EVENTS,
    CF_STATS,
    CF_CLAIMS,
    CF_PAYMENT_CENTERS,
    CF_PAYMENT_CENTER_IDS,
    CF_PAYMENTS,
    CF_OVER_UNDER,
    CF_SEQUENCES,
    CF_BACKUPS,
];

#[derive(Serialize)]
struct BackupDocument<'a> {
    backup: &'a BackupRef,
    payment_centers: Vec<PaymentCenter>,
    over_under: Vec<OverUnderRecord>,
    line_payments: Vec<ServiceLinePayment>,
    claim_payments: Vec<ClaimPayment>,
}

/// A persistent store implementation using RocksDB.
///
/// Each entity lives in its own Column Family with JSON values. Writes that
/// must be check-then-insert (payment-center creation, counter reservation)
/// are serialized through `write_lock`, so one process is the only writer.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

fn claim_prefix(event_id: &str, source: ClaimSource) -> String {
    let tag = match source {
        ClaimSource::WorkingSet => "W",
        ClaimSource::Production => "P",
    };
    format!("{event_id}/{tag}/")
}

fn over_under_key(record: &OverUnderRecord) -> String {
    format!(
        "{:020}/{}/{}",
        record.payment_center_id.0, record.origin_event_id, record.reference
    )
}

fn encode<T: Serialize>(value: &T) -> RepoResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RepositoryError::Backend(format!("serialization error: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RepoResult<T> {
    serde_json::from_slice(bytes).map_err(|e| RepositoryError::Backend(format!("deserialization error: {e}")))
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every column family the repository ports need exists.
    pub fn open<P: AsRef<Path>>(path: P) -> RepoResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> RepoResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RepositoryError::Backend(format!("column family `{name}` not found")))
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> RepoResult<()> {
        let handle = self.cf(cf)?;
        self.db.put_cf(handle, key, encode(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> RepoResult<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_pinned_cf(handle, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: &str) -> RepoResult<Vec<T>> {
        let handle = self.cf(cf)?;
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    /// Writes the seed contents, overwriting records with the same keys.
    pub fn apply_seed(&self, seed: &Seed) -> RepoResult<()> {
        self.put(CF_EVENTS, seed.event.event_id.as_bytes(), &seed.event)?;
        for center in &seed.payment_centers {
            self.put_center(center)?;
        }
        for record in &seed.over_under {
            self.put(CF_OVER_UNDER, over_under_key(record).as_bytes(), record)?;
        }
        for (counter, next) in &seed.sequences {
            let handle = self.cf(CF_SEQUENCES)?;
            self.db.put_cf(handle, counter.as_bytes(), next.to_be_bytes())?;
        }
        Ok(())
    }

    /// Stores the claims of `event_id` in both the working set and production.
    pub fn load_claims(&self, event_id: &str, claims: &[Claim]) -> RepoResult<()> {
        for claim in claims {
            for source in [ClaimSource::WorkingSet, ClaimSource::Production] {
                let key = format!("{}{}", claim_prefix(event_id, source), claim.claim_id);
                self.put(CF_CLAIMS, key.as_bytes(), claim)?;
            }
        }
        Ok(())
    }

    pub fn saved_stats(&self, event_id: &str) -> RepoResult<Option<PaymentEventStats>> {
        self.get(CF_STATS, event_id.as_bytes())
    }

    pub fn over_under_records(&self) -> RepoResult<Vec<OverUnderRecord>> {
        self.scan(CF_OVER_UNDER, "")
    }

    pub fn line_payments(&self) -> RepoResult<Vec<ServiceLinePayment>> {
        self.scan(CF_PAYMENTS, "L/")
    }

    pub fn claim_payments(&self) -> RepoResult<Vec<ClaimPayment>> {
        self.scan(CF_PAYMENTS, "C/")
    }

    /// Rewrites ledger documents that still carry the legacy `remainingAmt`
    /// field to the canonical `remaining_amount`. Returns the number rewritten.
    pub fn migrate_legacy_over_under(&self) -> RepoResult<usize> {
        let handle = self.cf(CF_OVER_UNDER)?;
        let mut rewrites = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            let mut document: serde_json::Value = decode(&value)?;
            let Some(fields) = document.as_object_mut() else {
                continue;
            };
            if let Some(legacy) = fields.remove("remainingAmt") {
                fields.entry("remaining_amount").or_insert(legacy);
                rewrites.push((key, encode(&document)?));
            }
        }
        for (key, value) in &rewrites {
            self.db.put_cf(handle, key, value)?;
        }
        Ok(rewrites.len())
    }

    fn put_center(&self, center: &PaymentCenter) -> RepoResult<()> {
        let key = center.key.to_string();
        self.put(CF_PAYMENT_CENTERS, key.as_bytes(), center)?;
        let handle = self.cf(CF_PAYMENT_CENTER_IDS)?;
        self.db.put_cf(handle, center.id.0.to_be_bytes(), key.as_bytes())?;
        Ok(())
    }

    fn next_sequence(&self, counter: &str) -> RepoResult<u64> {
        let handle = self.cf(CF_SEQUENCES)?;
        match self.db.get_pinned_cf(handle, counter.as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| RepositoryError::Backend(format!("corrupt counter `{counter}`")))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(SEQUENCE_START),
        }
    }
}

#[async_trait]
impl EventRepository for RocksDBStore {
    async fn load_payment_event(&self, event_id: &str) -> RepoResult<PaymentEvent> {
        self.get(CF_EVENTS, event_id.as_bytes())?
            .ok_or_else(|| RepositoryError::NotFound(format!("payment event {event_id}")))
    }

    async fn save_stats(&self, stats: &PaymentEventStats) -> RepoResult<()> {
        self.put(CF_STATS, stats.event_id.as_bytes(), stats)
    }
}

impl ClaimRepository for RocksDBStore {
    fn fetch_claims(
        &self,
        event_id: &str,
        source: ClaimSource,
        projection: Option<ClaimProjection>,
    ) -> BoxStream<'static, RepoResult<Claim>> {
        match self.scan::<Claim>(CF_CLAIMS, &claim_prefix(event_id, source)) {
            Ok(claims) => stream::iter(claims.into_iter().map(move |mut claim| {
                if projection.is_some_and(|p| !p.include_service_lines) {
                    claim.service_lines.clear();
                }
                Ok(claim)
            }))
            .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

#[async_trait]
impl PaymentCenterRepository for RocksDBStore {
    async fn lookup_payment_centers(
        &self,
        keys: &[PaymentCenterKey],
    ) -> RepoResult<HashMap<PaymentCenterKey, PaymentCenter>> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(center) = self.get::<PaymentCenter>(CF_PAYMENT_CENTERS, key.to_string().as_bytes())? {
                found.insert(key.clone(), center);
            }
        }
        Ok(found)
    }

    async fn create_payment_centers(&self, centers: Vec<PaymentCenter>) -> RepoResult<Vec<CreateAck>> {
        let _guard = self.write_lock.lock().await;
        let ids = self.cf(CF_PAYMENT_CENTER_IDS)?;
        let mut acks = Vec::with_capacity(centers.len());
        for center in centers {
            if let Some(existing) = self.get::<PaymentCenter>(CF_PAYMENT_CENTERS, center.key.to_string().as_bytes())? {
                acks.push(CreateAck::AlreadyExists(existing));
                continue;
            }
            if let Some(owner) = self.db.get_pinned_cf(ids, center.id.0.to_be_bytes())? {
                acks.push(CreateAck::Rejected {
                    reason: format!(
                        "id {} already belongs to {}",
                        center.id,
                        String::from_utf8_lossy(&owner)
                    ),
                    key: center.key,
                });
                continue;
            }
            self.put_center(&center)?;
            acks.push(CreateAck::Created(center));
        }
        Ok(acks)
    }
}

#[async_trait]
impl PaymentRepository for RocksDBStore {
    async fn persist_service_line_payment(
        &self,
        payments: Vec<ServiceLinePayment>,
    ) -> RepoResult<Vec<RecordAck>> {
        let mut acks = Vec::with_capacity(payments.len());
        for payment in payments {
            let id = payment.record_key();
            let key = format!("L/{id}");
            acks.push(match self.put(CF_PAYMENTS, key.as_bytes(), &payment) {
                Ok(()) => RecordAck::Acknowledged(id),
                Err(e) => RecordAck::Failed {
                    id,
                    reason: e.to_string(),
                },
            });
        }
        Ok(acks)
    }

    async fn persist_claim_aggregate(&self, payments: Vec<ClaimPayment>) -> RepoResult<Vec<RecordAck>> {
        let mut acks = Vec::with_capacity(payments.len());
        for payment in payments {
            let key = format!("C/{}/{}", payment.event_id, payment.parent_claim_id);
            acks.push(match self.put(CF_PAYMENTS, key.as_bytes(), &payment) {
                Ok(()) => RecordAck::Acknowledged(payment.parent_claim_id.clone()),
                Err(e) => RecordAck::Failed {
                    id: payment.parent_claim_id.clone(),
                    reason: e.to_string(),
                },
            });
        }
        Ok(acks)
    }

    async fn fetch_prior_over_under(
        &self,
        centers: &[PaymentCenterId],
        event_id: &str,
    ) -> RepoResult<Vec<OverUnderRecord>> {
        let mut records = Vec::new();
        for center in centers {
            let prefix = format!("{:020}/", center.0);
            records.extend(
                self.scan::<OverUnderRecord>(CF_OVER_UNDER, &prefix)?
                    .into_iter()
                    .filter(|r| r.origin_event_id != event_id),
            );
        }
        Ok(records)
    }

    async fn upsert_over_under(&self, _event_id: &str, records: Vec<OverUnderRecord>) -> RepoResult<Vec<RecordAck>> {
        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            acks.push(match self.put(CF_OVER_UNDER, over_under_key(&record).as_bytes(), &record) {
                Ok(()) => RecordAck::Acknowledged(record.reference.clone()),
                Err(e) => RecordAck::Failed {
                    id: record.reference.clone(),
                    reason: e.to_string(),
                },
            });
        }
        Ok(acks)
    }
}

#[async_trait]
impl BackupRepository for RocksDBStore {
    async fn backup(&self, event_id: &str, entity_sets: &[EntitySet]) -> RepoResult<BackupRef> {
        let _guard = self.write_lock.lock().await;
        let mut payment_centers = Vec::new();
        let mut over_under = Vec::new();
        let mut line_payments = Vec::new();
        let mut claim_payments = Vec::new();
        for set in entity_sets {
            match set {
                EntitySet::PaymentCenters => payment_centers = self.scan(CF_PAYMENT_CENTERS, "")?,
                EntitySet::OverUnder => over_under = self.scan(CF_OVER_UNDER, "")?,
                EntitySet::Payments => {
                    line_payments = self.scan(CF_PAYMENTS, "L/")?;
                    claim_payments = self.scan(CF_PAYMENTS, "C/")?;
                }
            }
        }
        let existing = self.scan::<serde_json::Value>(CF_BACKUPS, &format!("backup-{event_id}-"))?;
        let backup = BackupRef {
            id: format!("backup-{event_id}-{}", existing.len() + 1),
            entity_sets: entity_sets.to_vec(),
            records: payment_centers.len() + over_under.len() + line_payments.len() + claim_payments.len(),
        };
        let document = BackupDocument {
            backup: &backup,
            payment_centers,
            over_under,
            line_payments,
            claim_payments,
        };
        self.put(CF_BACKUPS, backup.id.as_bytes(), &document)?;
        Ok(backup)
    }
}

#[async_trait]
impl SequenceRepository for RocksDBStore {
    async fn reserve_sequence_chunk(&self, counter: &str, size: u64) -> RepoResult<SequenceChunk> {
        let _guard = self.write_lock.lock().await;
        let start = self.next_sequence(counter)?;
        let end = start
            .checked_add(size)
            .ok_or_else(|| RepositoryError::SequenceExhausted(counter.to_string()))?;
        let handle = self.cf(CF_SEQUENCES)?;
        self.db.put_cf(handle, counter.as_bytes(), end.to_be_bytes())?;
        Ok(SequenceChunk::new(counter, start, end))
    }

    async fn current_sequence(&self, counter: &str) -> RepoResult<u64> {
        self.next_sequence(counter)
    }
}
