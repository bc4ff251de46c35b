//! Deciding whether, and how, a step starts within a job execution.

use batchforge_core::{BatchStatus, ExecutionContext, JobExecutionId, JobInstanceId, StepExecution};
use batchforge_infra::JobRepository;
use tracing::info;

use crate::error::StepError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartRules {
    /// Run the step again even when its last execution completed.
    pub allow_start_if_complete: bool,
    /// Maximum number of executions of the step within one job instance.
    pub start_limit: Option<usize>,
}

/// Create and save the next execution of `step_name`, or return `None` when
/// the step already completed and must not run again.
///
/// A step whose last execution `STOPPED` or `FAILED` restarts with that
/// execution's context; otherwise it starts from `seed`.
pub fn prepare_step_execution(
    repository: &dyn JobRepository,
    job_execution_id: JobExecutionId,
    job_instance_id: JobInstanceId,
    step_name: &str,
    rules: RestartRules,
    seed: ExecutionContext,
) -> Result<Option<StepExecution>, StepError> {
    let mut context = seed;

    if let Some(last) = repository.get_last_step_execution(job_instance_id, step_name)? {
        match last.status {
            BatchStatus::Unknown => {
                return Err(StepError::Restart(format!(
                    "last execution of step {step_name} ended UNKNOWN; abandon it before restarting"
                )));
            }
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping => {
                return Err(StepError::Restart(format!(
                    "step {step_name} is {} and may still be running",
                    last.status.as_str()
                )));
            }
            BatchStatus::Abandoned => {
                return Err(StepError::Restart(format!("step {step_name} was abandoned")));
            }
            BatchStatus::Completed => {
                if last.job_execution_id != job_execution_id && !rules.allow_start_if_complete {
                    info!(step = step_name, "step already completed, not starting it again");
                    return Ok(None);
                }
            }
            BatchStatus::Stopped | BatchStatus::Failed => {
                info!(step = step_name, status = last.status.as_str(), "restarting step from its last checkpoint");
                context = last.execution_context;
            }
        }
    }

    if let Some(limit) = rules.start_limit {
        let count = repository.step_execution_count(job_instance_id, step_name)?;
        if count >= limit {
            return Err(StepError::Restart(format!(
                "step {step_name} reached its start limit of {limit}"
            )));
        }
    }

    let mut step = StepExecution::new(step_name, job_execution_id, job_instance_id);
    step.execution_context = context;
    repository.save_step_execution(&mut step)?;
    Ok(Some(step))
}

#[cfg(test)]
mod tests {
    use batchforge_core::{ExitStatus, JobExecution, JobParameters};
    use batchforge_infra::InMemoryJobRepository;

    use super::*;

    fn finish(repository: &InMemoryJobRepository, step: &mut StepExecution, status: BatchStatus) {
        step.status = status;
        step.exit_status = ExitStatus::new(status.as_str());
        repository.update_step_execution(step).unwrap();
    }

    fn next_job_execution(repository: &InMemoryJobRepository, previous: &mut JobExecution) -> JobExecution {
        previous.status = BatchStatus::Failed;
        repository.update_job_execution(previous).unwrap();
        repository
            .create_job_execution("import", &JobParameters::new().with_long("run", 1))
            .unwrap()
    }

    fn prepare(
        repository: &InMemoryJobRepository,
        job: &JobExecution,
        rules: RestartRules,
    ) -> Result<Option<StepExecution>, StepError> {
        prepare_step_execution(
            repository,
            job.id.unwrap(),
            job.job_instance.id,
            "load",
            rules,
            ExecutionContext::new(),
        )
    }

    #[test]
    fn failed_step_restarts_with_its_context() {
        let repository = InMemoryJobRepository::new();
        let mut first = repository
            .create_job_execution("import", &JobParameters::new().with_long("run", 1))
            .unwrap();
        let mut step = prepare(&repository, &first, RestartRules::default()).unwrap().unwrap();
        step.execution_context.put_i64("lines", 40);
        repository.update_step_execution_context(&step).unwrap();
        finish(&repository, &mut step, BatchStatus::Failed);

        let second = next_job_execution(&repository, &mut first);
        let restarted = prepare(&repository, &second, RestartRules::default()).unwrap().unwrap();
        assert_eq!(restarted.execution_context.get_i64("lines"), Some(40));
        assert!(restarted.id.is_some());
        assert_ne!(restarted.id, step.id);
    }

    #[test]
    fn completed_step_is_not_started_again_unless_allowed() {
        let repository = InMemoryJobRepository::new();
        let mut first = repository
            .create_job_execution("import", &JobParameters::new().with_long("run", 1))
            .unwrap();
        let mut step = prepare(&repository, &first, RestartRules::default()).unwrap().unwrap();
        finish(&repository, &mut step, BatchStatus::Completed);

        let second = next_job_execution(&repository, &mut first);
        assert!(prepare(&repository, &second, RestartRules::default()).unwrap().is_none());

        let again = RestartRules {
            allow_start_if_complete: true,
            ..RestartRules::default()
        };
        let step = prepare(&repository, &second, again).unwrap().unwrap();
        assert!(step.execution_context.is_empty());
    }

    #[test]
    fn running_or_unknown_steps_refuse_to_start() {
        let repository = InMemoryJobRepository::new();
        let job = repository
            .create_job_execution("import", &JobParameters::new())
            .unwrap();
        let mut step = prepare(&repository, &job, RestartRules::default()).unwrap().unwrap();
        finish(&repository, &mut step, BatchStatus::Started);
        assert!(matches!(
            prepare(&repository, &job, RestartRules::default()),
            Err(StepError::Restart(_))
        ));

        finish(&repository, &mut step, BatchStatus::Unknown);
        assert!(matches!(
            prepare(&repository, &job, RestartRules::default()),
            Err(StepError::Restart(_))
        ));
    }

    #[test]
    fn start_limit_counts_previous_executions() {
        let repository = InMemoryJobRepository::new();
        let job = repository
            .create_job_execution("import", &JobParameters::new())
            .unwrap();
        let rules = RestartRules {
            start_limit: Some(1),
            ..RestartRules::default()
        };
        let mut step = prepare(&repository, &job, rules).unwrap().unwrap();
        finish(&repository, &mut step, BatchStatus::Failed);
        assert!(matches!(prepare(&repository, &job, rules), Err(StepError::Restart(_))));
    }
}
