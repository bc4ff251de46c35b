//! `batchforge-core` — batch execution domain model.
//!
//! This crate contains **pure domain** types: identities, statuses, executions
//! and their checkpoint contexts. Persistence and the chunk engine live in the
//! `infra` and `engine` crates.

pub mod context;
pub mod error;
pub mod execution;
pub mod id;
pub mod parameters;
pub mod status;
pub mod version;

pub use context::ExecutionContext;
pub use error::{DomainError, DomainResult};
pub use execution::{JobExecution, JobInstance, StepContribution, StepCounters, StepExecution};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use parameters::{JobParameter, JobParameters, ParameterValue};
pub use status::{BatchStatus, ExitStatus, MAX_EXIT_DESCRIPTION_LEN, describe_error};
pub use version::{ExpectedVersion, Versioned};
