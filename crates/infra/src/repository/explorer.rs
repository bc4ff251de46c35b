//! Read-only query interface over recorded executions.
//!
//! Intended for operators and dashboards; the engine itself only uses
//! [`JobRepository`](super::JobRepository).

use serde::{Deserialize, Serialize};

use batchforge_core::{JobExecution, JobExecutionId, JobInstance, StepExecution};

use super::in_memory::InMemoryJobRepository;
use super::r#trait::{JobRepository, RepositoryError};

/// Pagination parameters for explorer queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of records to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }

    fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}

/// A job execution together with its step executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution: JobExecution,
    pub steps: Vec<StepExecution>,
}

/// Async query interface for execution inspection.
#[async_trait::async_trait]
pub trait JobExplorer: Send + Sync {
    /// Distinct job names, sorted.
    async fn job_names(&self) -> Result<Vec<String>, RepositoryError>;

    /// Instances of a job, newest first.
    async fn find_job_instances(
        &self,
        job_name: &str,
        pagination: Pagination,
    ) -> Result<Vec<JobInstance>, RepositoryError>;

    /// Executions of a job that are still STARTING, STARTED or STOPPING.
    async fn find_running_job_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecution>, RepositoryError>;

    async fn execution_summary(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<ExecutionSummary>, RepositoryError>;
}

#[async_trait::async_trait]
impl JobExplorer for InMemoryJobRepository {
    async fn job_names(&self) -> Result<Vec<String>, RepositoryError> {
        self.distinct_job_names()
    }

    async fn find_job_instances(
        &self,
        job_name: &str,
        pagination: Pagination,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        Ok(pagination.apply(self.job_instances(job_name)?))
    }

    async fn find_running_job_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        self.running_job_executions(job_name)
    }

    async fn execution_summary(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<ExecutionSummary>, RepositoryError> {
        let Some(execution) = self.get_job_execution(id)? else {
            return Ok(None);
        };
        let steps = self.find_step_executions(id)?;
        Ok(Some(ExecutionSummary { execution, steps }))
    }
}
