use std::ops::Range;

use crate::error::ValidationError;

pub const BYTES_PER_GIGABYTE: f64 = 1024.0 * 1024.0 * 1024.0;

/// Splits the reaches of a run into contiguous ranges whose aligned forecast
/// data fits in a memory budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchPartitioner {
    pub budget_bytes: u64,
    pub lead_days: usize,
    pub ensemble_width: usize,
    pub bytes_per_element: usize,
}

impl BatchPartitioner {
    pub fn from_gigabytes(
        memory_gb: f64,
        lead_days: usize,
        ensemble_width: usize,
        bytes_per_element: usize,
    ) -> Self {
        let budget = (memory_gb.max(0.0) * BYTES_PER_GIGABYTE).floor();
        Self {
            budget_bytes: if budget >= u64::MAX as f64 {
                u64::MAX
            } else {
                budget as u64
            },
            lead_days,
            ensemble_width,
            bytes_per_element,
        }
    }

    /// Bytes one reach occupies across `date_count` archives.
    pub fn reach_footprint(&self, date_count: usize) -> u64 {
        (date_count as u64)
            .saturating_mul(self.ensemble_width as u64)
            .saturating_mul(self.lead_days as u64)
            .saturating_mul(self.bytes_per_element as u64)
    }

    pub fn max_reaches_per_batch(&self, date_count: usize) -> Result<usize, ValidationError> {
        let reach_bytes = self.reach_footprint(date_count);
        if reach_bytes > self.budget_bytes {
            return Err(ValidationError::InsufficientMemory {
                budget_bytes: self.budget_bytes,
                reach_bytes,
            });
        }
        if reach_bytes == 0 {
            return Ok(usize::MAX);
        }

        let reaches = self.budget_bytes / reach_bytes;
        Ok(usize::try_from(reaches).unwrap_or(usize::MAX).max(1))
    }

    pub fn partition(
        &self,
        reach_count: usize,
        date_count: usize,
    ) -> Result<Vec<Range<usize>>, ValidationError> {
        let per_batch = self.max_reaches_per_batch(date_count)?;

        let mut batches = Vec::new();
        let mut start = 0;
        while start < reach_count {
            let end = start.saturating_add(per_batch).min(reach_count);
            batches.push(start..end);
            start = end;
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ENSEMBLE_MEMBERS, LEAD_DAYS};

    fn partitioner(budget_bytes: u64) -> BatchPartitioner {
        BatchPartitioner {
            budget_bytes,
            lead_days: LEAD_DAYS,
            ensemble_width: ENSEMBLE_MEMBERS,
            bytes_per_element: 8,
        }
    }

    #[test]
    fn footprint_folds_in_every_geometry_axis() {
        assert_eq!(partitioner(0).reach_footprint(120), 120 * 51 * 15 * 8);
    }

    #[test]
    fn ranges_cover_all_reaches_in_order() {
        let footprint = partitioner(0).reach_footprint(10);
        let batches = partitioner(footprint * 3 + footprint / 2)
            .partition(10, 10)
            .unwrap();
        assert_eq!(batches, vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn generous_budget_yields_a_single_batch() {
        let batches = BatchPartitioner::from_gigabytes(4.0, LEAD_DAYS, ENSEMBLE_MEMBERS, 8)
            .partition(5000, 120)
            .unwrap();
        assert_eq!(batches, vec![0..5000]);
    }

    #[test]
    fn no_batch_exceeds_the_budget() {
        for budget in [61_200_u64, 100_000, 1_000_000, 7_777_777] {
            let partitioner = partitioner(budget);
            let batches = partitioner.partition(1000, 5).unwrap();
            for batch in &batches {
                assert!(batch.len() as u64 * partitioner.reach_footprint(5) <= budget);
                assert!(batch.len() as u64 * 5 * ENSEMBLE_MEMBERS as u64 * 8 <= budget);
            }
            assert_eq!(batches.first().map(|b| b.start), Some(0));
            assert_eq!(batches.last().map(|b| b.end), Some(1000));
        }
    }

    #[test]
    fn smaller_budget_never_reduces_batch_count() {
        let mut previous = 0;
        for budget in [50_000_000_u64, 5_000_000, 500_000, 61_200] {
            let count = partitioner(budget).partition(1000, 5).unwrap().len();
            assert!(count >= previous);
            previous = count;
        }
    }

    #[test]
    fn budget_below_one_reach_is_insufficient_memory() {
        let footprint = partitioner(0).reach_footprint(30);
        let err = partitioner(footprint - 1).partition(10, 30).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InsufficientMemory { reach_bytes, .. } if reach_bytes == footprint
        ));
    }

    #[test]
    fn zero_reaches_produce_no_batches() {
        assert!(partitioner(1 << 30).partition(0, 30).unwrap().is_empty());
    }
}
