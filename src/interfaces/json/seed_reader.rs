use crate::error::Result;
use crate::infrastructure::seed::Seed;
use std::io::Read;

/// Reads the JSON seed document that primes a store before a run.
pub struct SeedReader<R: Read> {
    source: R,
}

impl<R: Read> SeedReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn read(self) -> Result<Seed> {
        Ok(serde_json::from_reader(self.source)?)
    }
}
