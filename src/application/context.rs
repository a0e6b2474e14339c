use super::batch::{Pools, PoolTier, WorkerPool};
use super::retry::RetryPolicy;
use super::sequence::SequenceAllocator;
use crate::config::RunConfig;
use crate::domain::ports::Repositories;
use crate::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything one run shares: store handles, configuration, pools and the
/// run-wide cancellation token. Passed explicitly; nothing is global.
#[derive(Clone)]
pub struct RunContext {
    pub repos: Repositories,
    pub config: RunConfig,
    pub pools: Pools,
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    pub allocator: Arc<SequenceAllocator>,
}

impl RunContext {
    pub fn new(repos: Repositories, config: RunConfig) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let retry = RetryPolicy::new(config.retry.clone());
        let pools = Pools {
            payment_center: WorkerPool::new(
                PoolTier::PaymentCenter,
                config.pools.payment_center_workers,
                cancel.clone(),
            ),
            claim_batch: WorkerPool::new(
                PoolTier::ClaimBatch,
                config.pools.claim_batch_workers,
                cancel.clone(),
            ),
            service_line: WorkerPool::new(
                PoolTier::ServiceLine,
                config.pools.service_line_workers,
                cancel.clone(),
            ),
        };
        let allocator = Arc::new(SequenceAllocator::new(
            repos.sequences.clone(),
            retry.clone(),
            cancel.clone(),
        ));
        Ok(Self {
            repos,
            config,
            pools,
            cancel,
            retry,
            allocator,
        })
    }
}
