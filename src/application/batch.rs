//! Fan-out/fan-in worker pools, ownership tracking and bulk writes.
//!
//! Three pool tiers (payment center, claim batch, service line) each bound their
//! own concurrency with a semaphore and share the run's `CancellationToken`, so a
//! fatal error anywhere stops new work everywhere.

use crate::domain::ports::RecordAck;
use crate::error::{PaymentProcessError, Result};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTier {
    PaymentCenter,
    ClaimBatch,
    ServiceLine,
}

impl fmt::Display for PoolTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolTier::PaymentCenter => write!(f, "payment-center"),
            PoolTier::ClaimBatch => write!(f, "claim-batch"),
            PoolTier::ServiceLine => write!(f, "service-line"),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    tier: PoolTier,
    size: usize,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(tier: PoolTier, size: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        Self {
            tier,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            cancel,
        }
    }

    /// Runs `task` for every item and waits for all of them.
    ///
    /// Results are returned in input order. The first failure cancels the
    /// remaining tasks of this call; they observe it through the token they
    /// are handed. The reported error is the first non-cancellation failure.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, task: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = items.len();
        let task = Arc::new(task);
        let scope = self.cancel.child_token();
        let mut set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let semaphore = self.semaphore.clone();
            let task = task.clone();
            let token = scope.clone();
            set.spawn(async move {
                let _permit = tokio::select! {
                    _ = token.cancelled() => return (index, Err(PaymentProcessError::Cancelled)),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                index,
                                Err(PaymentProcessError::Concurrency("worker pool closed".into())),
                            );
                        }
                    },
                };
                if token.is_cancelled() {
                    return (index, Err(PaymentProcessError::Cancelled));
                }
                (index, task(item, token).await)
            });
        }

        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut failure: Option<PaymentProcessError> = None;

        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok((index, Ok(value))) => {
                    slots[index] = Some(value);
                    continue;
                }
                Ok((_, Err(e))) => e,
                Err(join_error) => {
                    PaymentProcessError::Concurrency(format!("{} task aborted: {join_error}", self.tier))
                }
            };
            scope.cancel();
            let replace = match &failure {
                None => true,
                Some(PaymentProcessError::Cancelled) => {
                    !matches!(outcome, PaymentProcessError::Cancelled)
                }
                Some(_) => false,
            };
            if replace {
                if !matches!(outcome, PaymentProcessError::Cancelled) {
                    warn!(tier = %self.tier, error = %outcome, "worker failed, cancelling siblings");
                }
                failure = Some(outcome);
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        debug!(tier = %self.tier, workers = self.size, tasks = total, "pool run complete");
        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| PaymentProcessError::Concurrency("worker produced no result".into()))
            })
            .collect()
    }
}

/// Worker pools of one run.
#[derive(Clone)]
pub struct Pools {
    pub payment_center: WorkerPool,
    pub claim_batch: WorkerPool,
    pub service_line: WorkerPool,
}

/// Tracks which work units are currently owned by a task.
#[derive(Clone)]
pub struct OwnershipRegistry<K> {
    owned: Arc<Mutex<HashSet<K>>>,
}

impl<K> Default for OwnershipRegistry<K> {
    fn default() -> Self {
        Self {
            owned: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

fn lock<K>(owned: &Mutex<HashSet<K>>) -> MutexGuard<'_, HashSet<K>> {
    match owned.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<K> OwnershipRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` for the caller until the returned guard is dropped.
    pub fn acquire(&self, key: K) -> Result<OwnershipGuard<K>> {
        let mut owned = lock(&self.owned);
        if !owned.insert(key.clone()) {
            return Err(PaymentProcessError::Concurrency(format!(
                "work unit {key} is already owned by another task"
            )));
        }
        Ok(OwnershipGuard {
            key,
            owned: self.owned.clone(),
        })
    }
}

pub struct OwnershipGuard<K: Eq + Hash> {
    key: K,
    owned: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Drop for OwnershipGuard<K> {
    fn drop(&mut self) {
        lock(&self.owned).remove(&self.key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub acknowledged: usize,
    pub failed: Vec<(String, String)>,
}

impl BulkOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, acks: Vec<RecordAck>) {
        for ack in acks {
            match ack {
                RecordAck::Acknowledged(_) => self.acknowledged += 1,
                RecordAck::Failed { id, reason } => self.failed.push((id, reason)),
            }
        }
    }
}

/// Writes `items` in `batch_size` batches with at most `max_in_flight` batches
/// outstanding. The producer waits for a free slot before dispatching the next
/// batch.
pub async fn bulk_write<T, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    max_in_flight: usize,
    cancel: &CancellationToken,
    write: F,
) -> Result<BulkOutcome>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<RecordAck>>> + Send + 'static,
{
    let batch_size = batch_size.max(1);
    let in_flight = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let write = Arc::new(write);
    let mut set = JoinSet::new();
    let mut outcome = BulkOutcome::default();
    let mut failure = None;

    let mut remaining = items.into_iter();
    loop {
        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                failure = Some(PaymentProcessError::Cancelled);
                break;
            }
            permit = in_flight.clone().acquire_owned() => permit
                .map_err(|_| PaymentProcessError::Concurrency("bulk writer closed".into()))?,
        };
        let write = write.clone();
        set.spawn(async move {
            let _permit = permit;
            write(batch).await
        });

        // Drain finished batches so acknowledgements do not pile up.
        while let Some(joined) = set.try_join_next() {
            collect(joined, &mut outcome, &mut failure);
        }
        if failure.is_some() {
            break;
        }
    }

    while let Some(joined) = set.join_next().await {
        collect(joined, &mut outcome, &mut failure);
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

fn collect(
    joined: std::result::Result<Result<Vec<RecordAck>>, tokio::task::JoinError>,
    outcome: &mut BulkOutcome,
    failure: &mut Option<PaymentProcessError>,
) {
    match joined {
        Ok(Ok(acks)) => outcome.absorb(acks),
        Ok(Err(e)) => {
            if failure.is_none() {
                *failure = Some(e);
            }
        }
        Err(join_error) => {
            if failure.is_none() {
                *failure = Some(PaymentProcessError::Concurrency(format!(
                    "bulk write task aborted: {join_error}"
                )));
            }
        }
    }
}
