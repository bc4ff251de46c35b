//! Execution repository boundary.
//!
//! Job instances, job executions, step executions and their execution
//! contexts, with optimistic locking on every update.

pub mod explorer;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use explorer::{ExecutionSummary, JobExplorer, Pagination};
pub use in_memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;
pub use r#trait::{JobRepository, RepositoryError};
