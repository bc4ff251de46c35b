//! Chunk-oriented batch engine: fault policies, the step loop and
//! partitioning.

pub mod chunk;
pub mod completion;
pub mod config;
pub mod error;
pub mod item;
pub mod listener;
pub mod monitor;
pub mod partition;
pub mod policy;
pub mod processor;
pub mod provider;
pub mod restart;
pub mod retry_cache;
pub mod step;
pub mod transaction;
mod worker;

mod integration_tests;

pub use chunk::{Chunk, SkipTally};
pub use completion::{CompletionPolicy, CompositeCompletionPolicy, SimpleCompletionPolicy, TimeoutCompletionPolicy};
pub use config::{StepConfig, StepSettings};
pub use error::{ConfigError, Phase, SkipLimitExceeded, StepError, Unrecoverable};
pub use item::{ItemProcessor, ItemReader, ItemWriter, ListItemReader, ListItemWriter, PassThroughProcessor};
pub use listener::{CompositeListener, StepListener};
pub use partition::{
    DefaultAggregator, LocalPartitionHandler, PartitionHandler, PartitionStep, Partitioner, RangePartitioner,
    RemoteStepExecutionAggregator, SimplePartitioner, StepExecutionAggregator, StepExecutionSplitter, StepFactory,
};
pub use policy::{FaultDecision, FaultRules, RetryPolicy, SkipPolicy};
pub use restart::{RestartRules, prepare_step_execution};
pub use retry_cache::{ItemKey, KeyGenerator, RetryContextCache};
pub use step::{ChunkStep, Step, StopSignal};
pub use transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};
