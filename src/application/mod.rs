//! Application layer containing the payment event pipeline.
//!
//! The [`orchestrator::Orchestrator`] drives a run through validation,
//! payment-center resolution, claim transformation, over/under staging and
//! calculation. Concurrency is handled by the bounded worker pools in
//! [`batch`], which share one cancellation token per run.

pub mod batch;
pub mod calculator;
pub mod context;
pub mod ledger;
pub mod orchestrator;
pub mod resolver;
pub mod retry;
pub mod sequence;
pub mod transformer;
pub mod validation;
