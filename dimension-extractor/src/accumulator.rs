use crate::extract::{DedupSet, DimensionOption};

/// Outcome of offering one option to the accumulator.
#[derive(Debug, PartialEq, Eq)]
pub enum Added {
    /// The file already produced this option
    Duplicate,
    /// Held back until the batch fills up or the file ends
    Queued,
    /// The batch reached its size and must be delivered
    Full(Vec<DimensionOption>),
}

/// Collects the options of one file, keeping each `(dimension, value)` once
/// and handing them out in batches of at most `batch_size`.
pub struct Accumulator {
    seen: DedupSet,
    batch: Vec<DimensionOption>,
    batch_size: usize,
    accepted: usize,
}

impl Accumulator {
    /// A `batch_size` of zero behaves as one.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            seen: DedupSet::new(),
            batch: Vec::with_capacity(batch_size),
            batch_size,
            accepted: 0,
        }
    }

    pub fn add(&mut self, option: DimensionOption) -> Added {
        if !self.seen.insert(option.dedup_key()) {
            return Added::Duplicate;
        }
        self.accepted += 1;
        self.batch.push(option);

        if self.batch.len() >= self.batch_size {
            let full = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
            return Added::Full(full);
        }
        Added::Queued
    }

    /// The partial batch left at the end of the file, if any.
    pub fn flush(&mut self) -> Option<Vec<DimensionOption>> {
        if self.batch.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.batch))
    }

    /// Keys accepted so far, for the extractor to skip.
    pub fn seen(&self) -> &DedupSet {
        &self.seen
    }

    /// Number of unique options accepted for the file.
    pub fn accepted(&self) -> usize {
        self.accepted
    }
}
