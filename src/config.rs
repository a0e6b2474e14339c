use crate::application::retry::RetryConfig;
use crate::domain::event::{PayeeType, RunMode};
use crate::error::{PaymentProcessError, Result};

/// Worker counts per pool tier.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub payment_center_workers: usize,
    pub claim_batch_workers: usize,
    pub service_line_workers: usize,
}

impl PoolConfig {
    pub fn uniform(workers: usize) -> Self {
        Self {
            payment_center_workers: workers,
            claim_batch_workers: workers,
            service_line_workers: workers,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::uniform(4)
    }
}

/// Everything a single run needs besides the stores.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub event_id: String,
    pub mode: RunMode,
    pub pools: PoolConfig,
    /// Claims per read chunk, parent groups per claim batch and records per bulk write.
    pub batch_size: usize,
    /// Ids reserved per claim-batch worker.
    pub sequence_chunk_size: u64,
    /// Bulk-write batches outstanding at once.
    pub max_in_flight: usize,
    pub retry: RetryConfig,
    /// Overrides the event's configured payee type.
    pub payee_type: Option<PayeeType>,
    pub validate_only: bool,
}

impl RunConfig {
    pub fn new(event_id: impl Into<String>, mode: RunMode) -> Self {
        Self {
            event_id: event_id.into(),
            mode,
            pools: PoolConfig::default(),
            batch_size: 1000,
            sequence_chunk_size: 1000,
            max_in_flight: 4,
            retry: RetryConfig::default(),
            payee_type: None,
            validate_only: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_id.trim().is_empty() {
            return Err(PaymentProcessError::Configuration(
                "event id must not be empty".into(),
            ));
        }
        let pools = &self.pools;
        if pools.payment_center_workers == 0
            || pools.claim_batch_workers == 0
            || pools.service_line_workers == 0
        {
            return Err(PaymentProcessError::Configuration(
                "worker counts must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(PaymentProcessError::Configuration(
                "batch size must be at least 1".into(),
            ));
        }
        if self.sequence_chunk_size == 0 {
            return Err(PaymentProcessError::Configuration(
                "sequence chunk size must be at least 1".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(PaymentProcessError::Configuration(
                "max in-flight batches must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(PaymentProcessError::Configuration(
                "retry backoff must be >= 1 and jitter within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
