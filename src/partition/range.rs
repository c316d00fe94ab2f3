use uuid::Uuid;

use crate::error::{DbspError, Result};

/// Splits a contiguous UUID range into `n` non-overlapping partitions.
///
/// UUIDs are treated as unsigned 128-bit big-endian integers. Partition `i`
/// covers `[split[i-1], split[i])` with `split[-1]` being the range start.
/// The last split is always the range end, so rounding leftovers are
/// absorbed by the final partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    start: Uuid,
    splits: Vec<Uuid>,
}

impl PartitionRange {
    /// Create a range spanning the entire UUID keyspace.
    pub fn new_full_range(num_partitions: usize) -> Result<Self> {
        Self::new(Uuid::nil(), Uuid::from_u128(u128::MAX), num_partitions)
    }

    pub fn new(start: Uuid, end: Uuid, num_partitions: usize) -> Result<Self> {
        if start >= end {
            return Err(DbspError::Partition(
                "range start UUID must be less than the end UUID".to_string(),
            ));
        }
        if num_partitions == 0 {
            return Err(DbspError::Partition(
                "number of partitions must be at least equal to 1".to_string(),
            ));
        }

        let (lo, hi) = (start.as_u128(), end.as_u128());
        // ceil((hi - lo + 1) / n) without overflowing on the full keyspace.
        let part_size = (hi - lo) / num_partitions as u128 + 1;

        let mut splits = Vec::with_capacity(num_partitions);
        for k in 1..num_partitions as u128 {
            let to = part_size
                .checked_mul(k)
                .and_then(|offset| lo.checked_add(offset))
                .filter(|&to| to < hi)
                .ok_or_else(|| {
                    DbspError::Partition(format!(
                        "range {start}..{end} is too narrow for {num_partitions} partitions"
                    ))
                })?;
            splits.push(Uuid::from_u128(to));
        }
        splits.push(end);

        Ok(Self { start, splits })
    }

    pub fn num_partitions(&self) -> usize {
        self.splits.len()
    }

    /// Returns the `(start, end)` UUIDs of the whole range.
    pub fn extents(&self) -> (Uuid, Uuid) {
        // splits is never empty
        (self.start, self.splits[self.splits.len() - 1])
    }

    /// Returns the `[from, to)` extents of a partition.
    pub fn partition_extents(&self, partition: usize) -> Result<(Uuid, Uuid)> {
        let to = *self.splits.get(partition).ok_or_else(|| {
            DbspError::Partition(format!(
                "invalid partition index {partition} (range has {} partitions)",
                self.splits.len()
            ))
        })?;
        let from = if partition == 0 {
            self.start
        } else {
            self.splits[partition - 1]
        };
        Ok((from, to))
    }

    /// Finds the partition that owns `id`.
    pub fn partition_for_id(&self, id: Uuid) -> Result<usize> {
        let index = self.splits.partition_point(|split| *split <= id);
        if id < self.start || index >= self.splits.len() {
            return Err(DbspError::Partition(format!(
                "unable to detect partition for ID {id}"
            )));
        }
        Ok(index)
    }
}
