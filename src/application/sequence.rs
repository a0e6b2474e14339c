use super::retry::RetryPolicy;
use crate::domain::ports::SequenceRepositoryRef;
use crate::domain::sequence::SequenceChunk;
use crate::error::{PaymentProcessError, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const PAYMENT_CENTER_COUNTER: &str = "payment_center";
pub const SERVICE_LINE_PAYMENT_COUNTER: &str = "service_line_payment";

/// Hands out disjoint identifier chunks from the sequence store.
///
/// Tracks how much each counter advanced during the run so final validation
/// can compare the stored counter against `start + reserved`.
pub struct SequenceAllocator {
    repository: SequenceRepositoryRef,
    retry: RetryPolicy,
    cancel: CancellationToken,
    reserved: Mutex<BTreeMap<String, u64>>,
}

impl SequenceAllocator {
    pub fn new(repository: SequenceRepositoryRef, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            repository,
            retry,
            cancel,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserves `[n, n + size)` on `counter`.
    ///
    /// Transient store failures go through the retry policy. Any other failure
    /// gets one more attempt before it is raised as `SequenceAllocation`.
    pub async fn allocate(&self, counter: &str, size: u64) -> Result<SequenceChunk> {
        if size == 0 {
            return Ok(SequenceChunk::new(counter, 0, 0));
        }

        let mut attempt = 0;
        let chunk = loop {
            let repository = self.repository.clone();
            let result = self
                .retry
                .execute(
                    || {
                        let repository = repository.clone();
                        async move { repository.reserve_sequence_chunk(counter, size).await }
                    },
                    "reserve_sequence_chunk",
                    &self.cancel,
                )
                .await;

            match result {
                Ok(chunk) => break chunk,
                Err(PaymentProcessError::Cancelled) => return Err(PaymentProcessError::Cancelled),
                Err(e) if attempt == 0 => {
                    warn!(counter, error = %e, "sequence allocation failed, retrying once");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PaymentProcessError::SequenceAllocation {
                        counter: counter.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        if chunk.len() != size {
            return Err(PaymentProcessError::SequenceAllocation {
                counter: counter.to_string(),
                reason: format!("asked for {size} ids, got {}", chunk.len()),
            });
        }

        self.record(counter, size);
        debug!(counter, start = chunk.start, end = chunk.end, "reserved sequence chunk");
        Ok(chunk)
    }

    fn record(&self, counter: &str, size: u64) {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *reserved.entry(counter.to_string()).or_default() += size;
    }

    /// Total reserved on `counter` by this allocator.
    pub fn reserved(&self, counter: &str) -> u64 {
        let reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reserved.get(counter).copied().unwrap_or(0)
    }

    pub async fn current(&self, counter: &str) -> Result<u64> {
        let repository = self.repository.clone();
        self.retry
            .execute(
                || {
                    let repository = repository.clone();
                    async move { repository.current_sequence(counter).await }
                },
                "current_sequence",
                &self.cancel,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::RetryConfig;
    use crate::domain::ports::SequenceRepository;
    use crate::error::{RepoResult, RepositoryError};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Fails the first `failures` reservations with a backend error.
    struct FlakyCounter {
        next: AtomicU64,
        failures: AtomicU32,
    }

    #[async_trait]
    impl SequenceRepository for FlakyCounter {
        async fn reserve_sequence_chunk(&self, counter: &str, size: u64) -> RepoResult<SequenceChunk> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
                .is_ok()
            {
                return Err(RepositoryError::Backend("write conflict".into()));
            }
            let start = self.next.fetch_add(size, Ordering::SeqCst);
            Ok(SequenceChunk::new(counter, start, start + size))
        }

        async fn current_sequence(&self, _counter: &str) -> RepoResult<u64> {
            Ok(self.next.load(Ordering::SeqCst))
        }
    }

    fn allocator(failures: u32) -> SequenceAllocator {
        let repo = Arc::new(FlakyCounter {
            next: AtomicU64::new(1),
            failures: AtomicU32::new(failures),
        });
        let retry = RetryPolicy::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        SequenceAllocator::new(repo, retry, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_allocation_retries_once() {
        let allocator = allocator(1);
        let chunk = allocator.allocate(SERVICE_LINE_PAYMENT_COUNTER, 10).await.unwrap();
        assert_eq!((chunk.start, chunk.end), (1, 11));
        assert_eq!(allocator.reserved(SERVICE_LINE_PAYMENT_COUNTER), 10);
        assert_eq!(allocator.current(SERVICE_LINE_PAYMENT_COUNTER).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal() {
        let allocator = allocator(2);
        let err = allocator.allocate(PAYMENT_CENTER_COUNTER, 5).await.unwrap_err();
        assert!(matches!(err, PaymentProcessError::SequenceAllocation { .. }));
        assert_eq!(allocator.reserved(PAYMENT_CENTER_COUNTER), 0);
    }

    #[tokio::test]
    async fn test_concurrent_chunks_are_disjoint() {
        let allocator = Arc::new(allocator(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.allocate(SERVICE_LINE_PAYMENT_COUNTER, 8).await.unwrap()
            }));
        }
        let mut chunks = Vec::new();
        for handle in handles {
            chunks.push(handle.await.unwrap());
        }
        chunks.sort_by_key(|c| c.start);
        for pair in chunks.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]));
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(allocator.reserved(SERVICE_LINE_PAYMENT_COUNTER), 128);
    }
}
