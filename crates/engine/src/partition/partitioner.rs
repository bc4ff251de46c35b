//! Partitioners: how one step's input is divided.

use std::collections::BTreeMap;

use batchforge_core::ExecutionContext;

/// Splits the input into named partitions, each seeded with its own context.
pub trait Partitioner: Send + Sync {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext>;
}

fn partition_name(index: usize) -> String {
    format!("partition{index}")
}

/// `grid_size` partitions with empty contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePartitioner;

impl Partitioner for SimplePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        (0..grid_size)
            .map(|i| (partition_name(i), ExecutionContext::new()))
            .collect()
    }
}

/// Divides an inclusive integer range into contiguous sub-ranges.
///
/// Each partition's bounds are written under `min_key` and `max_key`. A range
/// shorter than the grid yields one partition per value.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    min: i64,
    max: i64,
    min_key: String,
    max_key: String,
}

impl RangePartitioner {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            min_key: "minValue".to_string(),
            max_key: "maxValue".to_string(),
        }
    }

    pub fn with_keys(mut self, min_key: impl Into<String>, max_key: impl Into<String>) -> Self {
        self.min_key = min_key.into();
        self.max_key = max_key.into();
        self
    }
}

impl Partitioner for RangePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        let mut partitions = BTreeMap::new();
        if grid_size == 0 || self.max < self.min {
            return partitions;
        }
        let span = (self.max - self.min) as u64 + 1;
        let size = span.div_ceil(grid_size as u64);

        let mut start = self.min;
        let mut index = 0;
        while start <= self.max {
            let end = start.saturating_add(size as i64 - 1).min(self.max);
            let mut context = ExecutionContext::new();
            context.put_i64(self.min_key.clone(), start);
            context.put_i64(self.max_key.clone(), end);
            partitions.insert(partition_name(index), context);
            index += 1;
            if end == self.max {
                break;
            }
            start = end + 1;
        }
        partitions
    }
}
