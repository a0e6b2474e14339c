use serde::{Deserialize, Serialize};

/// A contiguous block `[start, end)` of identifier values reserved by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceChunk {
    pub counter: String,
    pub start: u64,
    pub end: u64,
    #[serde(skip)]
    cursor: u64,
}

impl SequenceChunk {
    pub fn new(counter: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            counter: counter.into(),
            start,
            end,
            cursor: start,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.cursor.max(self.start)
    }

    pub fn next_id(&mut self) -> Option<u64> {
        let cursor = self.cursor.max(self.start);
        if cursor < self.end {
            self.cursor = cursor + 1;
            Some(cursor)
        } else {
            None
        }
    }

    pub fn overlaps(&self, other: &SequenceChunk) -> bool {
        self.counter == other.counter && self.start < other.end && other.start < self.end
    }
}
