//! Domain model of a payment event run and the repository ports it talks through.

pub mod claim;
pub mod event;
pub mod money;
pub mod over_under;
pub mod payment;
pub mod payment_center;
pub mod ports;
pub mod sequence;
pub mod stats;
