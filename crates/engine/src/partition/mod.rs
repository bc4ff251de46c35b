//! Partitioned steps: one step split into independent executions that run
//! concurrently and are folded back into the manager execution.

pub mod aggregator;
pub mod handler;
pub mod partitioner;
pub mod splitter;
pub mod step;

pub use aggregator::{DefaultAggregator, RemoteStepExecutionAggregator, StepExecutionAggregator};
pub use handler::{LocalPartitionHandler, PartitionHandler, StepFactory};
pub use partitioner::{Partitioner, RangePartitioner, SimplePartitioner};
pub use splitter::{GRID_SIZE_KEY, StepExecutionSplitter};
pub use step::PartitionStep;
