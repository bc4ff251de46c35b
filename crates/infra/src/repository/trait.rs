use std::sync::Arc;

use thiserror::Error;

use batchforge_core::{
    DomainError, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobParameters,
    StepExecution, StepExecutionId,
};

/// Execution repository operation error.
///
/// These are **infrastructure errors** (storage, concurrency, lifecycle
/// preconditions) as opposed to domain errors.
///
/// ## Error Categories
///
/// - **Concurrency**: the conditional update matched no row (stale version)
/// - **InstanceAlreadyExists**: a job instance with the same identity exists
/// - **AlreadyRunning / AlreadyComplete / RestartNotAllowed**: a new job
///   execution cannot be created for the instance
/// - **InvalidArgument**: the caller passed a record in the wrong state (e.g.
///   saving a record that already has an identity)
/// - **Storage / Serialization**: the backing store or context codec failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("job instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("job execution already running: {0}")]
    AlreadyRunning(String),

    #[error("job instance already complete: {0}")]
    AlreadyComplete(String),

    #[error("restart not allowed: {0}")]
    RestartNotAllowed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<DomainError> for RepositoryError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Serialization(msg) => RepositoryError::Serialization(msg),
            DomainError::Conflict(msg) => RepositoryError::Concurrency(msg),
            other => RepositoryError::InvalidArgument(other.to_string()),
        }
    }
}

/// Persistence of job instances, job executions, step executions and their
/// execution contexts.
///
/// The repository is the only shared mutable state between a running step and
/// the outside world (operators, restarts, partition managers).
///
/// ## Identity and versions
///
/// `save_*` assigns a fresh identity and version `0`; the argument must not
/// carry either yet. `update_*` is a conditional write on `(id, version)`:
/// when no stored row matches, the call fails with
/// [`RepositoryError::Concurrency`] and nothing is written. On success the
/// stored version and the caller's copy both advance by exactly one.
///
/// ## Execution contexts
///
/// Contexts are stored separately from their owning rows and always replaced
/// wholesale with the serialized JSON map.
///
/// ## Interruption
///
/// `update_step_execution` reads the parent job execution's status; if an
/// operator has moved it to `STOPPING`, the step's `terminate_only` flag is set
/// so the step loop stops at its next chunk boundary.
pub trait JobRepository: Send + Sync {
    /// Create the instance for `(job_name, identifying parameters)`.
    ///
    /// Fails with [`RepositoryError::InstanceAlreadyExists`] when the identity is
    /// taken.
    fn create_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError>;

    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError>;

    fn is_job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError> {
        Ok(self.get_job_instance(job_name, parameters)?.is_some())
    }

    /// Create and save a new execution for the job instance, creating the
    /// instance if needed.
    ///
    /// For an existing instance this refuses when an execution is still running,
    /// when the last status is `UNKNOWN`, or when an execution already completed
    /// (unless the job has no identifying parameters). A restarted execution
    /// starts with the context of the previous one.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError>;

    fn save_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError>;

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError>;

    /// Pull the persisted status and version into a possibly stale copy.
    ///
    /// The status is combined with `upgrade_to`, so it never regresses.
    fn synchronize_status(&self, execution: &mut JobExecution) -> Result<(), RepositoryError>;

    fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, RepositoryError>;

    /// All executions of an instance, newest first.
    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, RepositoryError>;

    /// The most recent execution (by start, else create time; ties broken by
    /// the highest identity).
    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError>;

    fn save_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;

    fn get_step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError>;

    /// Step executions of one job execution, in identity order.
    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, RepositoryError>;

    /// The most recent execution of `step_name` across every execution of the
    /// instance (by start, else create time; ties broken by the highest identity).
    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError>;

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<usize, RepositoryError>;

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError>;

    fn update_job_execution_context(&self, execution: &JobExecution)
    -> Result<(), RepositoryError>;

    /// Persist a chunk commit: the step row (versioned) and its context,
    /// atomically.
    fn checkpoint_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;
}

impl<S> JobRepository for Arc<S>
where
    S: JobRepository + ?Sized,
{
    fn create_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError> {
        (**self).create_job_instance(job_name, parameters)
    }

    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        (**self).get_job_instance(job_name, parameters)
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        (**self).create_job_execution(job_name, parameters)
    }

    fn save_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        (**self).save_job_execution(execution)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        (**self).update_job_execution(execution)
    }

    fn synchronize_status(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        (**self).synchronize_status(execution)
    }

    fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        (**self).get_job_execution(id)
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        (**self).find_job_executions(instance_id)
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        (**self).get_last_job_execution(job_name, parameters)
    }

    fn save_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        (**self).save_step_execution(step)
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        (**self).update_step_execution(step)
    }

    fn get_step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        (**self).get_step_execution(id)
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        (**self).find_step_executions(job_execution_id)
    }

    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        (**self).get_last_step_execution(instance_id, step_name)
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        (**self).step_execution_count(instance_id, step_name)
    }

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        (**self).update_step_execution_context(step)
    }

    fn update_job_execution_context(
        &self,
        execution: &JobExecution,
    ) -> Result<(), RepositoryError> {
        (**self).update_job_execution_context(execution)
    }

    fn checkpoint_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        (**self).checkpoint_step_execution(step)
    }
}

/// Check the restart preconditions of an existing instance against its
/// executions (newest first) and return the execution whose context seeds the
/// new one.
///
/// Shared by every repository implementation.
pub(crate) fn check_restartable<'a>(
    instance: &JobInstance,
    parameters: &JobParameters,
    executions: &'a [JobExecution],
) -> Result<&'a JobExecution, RepositoryError> {
    use batchforge_core::BatchStatus;

    let last = executions.first().ok_or_else(|| {
        RepositoryError::InvalidArgument(format!(
            "no job execution found for job instance {}",
            instance.id
        ))
    })?;

    for execution in executions {
        if execution.is_running() {
            return Err(RepositoryError::AlreadyRunning(format!(
                "job '{}' instance {} has a running execution ({})",
                instance.job_name,
                instance.id,
                execution.status
            )));
        }
        match execution.status {
            BatchStatus::Unknown => {
                return Err(RepositoryError::RestartNotAllowed(format!(
                    "job '{}' instance {} ended with status UNKNOWN",
                    instance.job_name, instance.id
                )));
            }
            BatchStatus::Completed | BatchStatus::Abandoned
                if !parameters.identifying().is_empty() =>
            {
                return Err(RepositoryError::AlreadyComplete(format!(
                    "job '{}' instance {} already ended with status {}",
                    instance.job_name, instance.id, execution.status
                )));
            }
            _ => {}
        }
    }

    Ok(last)
}
