//! Infrastructure layer: execution repositories and their configuration.

pub mod config;
pub mod repository;

pub use config::{ConfigError, RepositoryConfig};
pub use repository::{
    ExecutionSummary, InMemoryJobRepository, JobExplorer, JobRepository, Pagination,
    PostgresJobRepository, RepositoryError,
};
