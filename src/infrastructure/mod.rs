//! Storage backends behind the repository ports.
//!
//! [`in_memory::InMemoryStore`] is always available. The RocksDB store needs
//! the `storage-rocksdb` feature.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod seed;
