//! Job instances, job executions and step executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobExecutionId, JobInstanceId, StepExecutionId};
use crate::parameters::JobParameters;
use crate::status::{BatchStatus, ExitStatus};
use crate::version::Versioned;

/// A logical job run identified by `(job_name, job_key)`.
///
/// Created once per identity and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    pub job_key: String,
    pub version: u64,
}

/// One attempt at running a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    /// Assigned by the repository on save.
    pub id: Option<JobExecutionId>,
    /// Assigned by the repository on save; +1 on every persisted update.
    pub version: Option<u64>,
    pub job_instance: JobInstance,
    pub job_parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
}

impl JobExecution {
    pub fn new(job_instance: JobInstance, job_parameters: JobParameters) -> Self {
        Self {
            id: None,
            version: None,
            job_instance,
            job_parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Ask a running execution to stop at its next chunk boundary.
    pub fn stop(&mut self) {
        if self.is_running() {
            self.status = BatchStatus::Stopping;
        }
    }

    /// Mark the execution as started now.
    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
        self.status = BatchStatus::Started;
        self.exit_status = ExitStatus::executing();
    }

    /// Fold the results of this execution's steps: worst status, combined exit
    /// status.
    pub fn aggregate_step_statuses(&mut self, steps: &[StepExecution]) {
        for step in steps {
            self.status = self.status.upgrade_to(step.status);
            self.exit_status = self.exit_status.clone().and(step.exit_status.clone());
        }
    }

    /// Build a new, unsaved step execution belonging to this job execution.
    pub fn create_step_execution(&self, step_name: impl Into<String>) -> DomainResult<StepExecution> {
        let job_execution_id = self
            .id
            .ok_or_else(|| DomainError::invariant("job execution has not been saved"))?;
        Ok(StepExecution::new(
            step_name,
            job_execution_id,
            self.job_instance.id,
        ))
    }
}

impl Versioned for JobExecution {
    fn version(&self) -> Option<u64> {
        self.version
    }
}

/// Item and transaction counters of a step execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
}

impl StepCounters {
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Add every counter of `other` to this one.
    pub fn accumulate(&mut self, other: &StepCounters) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.filter_count += other.filter_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
    }
}

/// Counter delta of one chunk, applied only when its transaction commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
}

impl StepContribution {
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Take the accumulated delta, leaving zeroes behind.
    pub fn take(&mut self) -> StepContribution {
        std::mem::take(self)
    }
}

/// One run of one step within a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Assigned by the repository on save.
    pub id: Option<StepExecutionId>,
    /// Assigned by the repository on save; +1 on every persisted update.
    pub version: Option<u64>,
    pub job_execution_id: JobExecutionId,
    pub job_instance_id: JobInstanceId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub counters: StepCounters,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    /// Descriptions of the failures that ended this execution.
    #[serde(default)]
    pub failures: Vec<String>,
    /// Set when a stop was requested; the step loop exits at the next chunk
    /// boundary. Never persisted.
    #[serde(skip)]
    pub terminate_only: bool,
}

impl StepExecution {
    pub fn new(
        step_name: impl Into<String>,
        job_execution_id: JobExecutionId,
        job_instance_id: JobInstanceId,
    ) -> Self {
        Self {
            id: None,
            version: None,
            job_execution_id,
            job_instance_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            counters: StepCounters::default(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            failures: Vec::new(),
            terminate_only: false,
        }
    }

    /// A sibling execution of `parent` (same job execution) with another name.
    pub fn sibling(parent: &StepExecution, step_name: impl Into<String>) -> Self {
        Self::new(step_name, parent.job_execution_id, parent.job_instance_id)
    }

    pub fn skip_count(&self) -> u64 {
        self.counters.skip_count()
    }

    /// Apply a committed chunk's delta.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.counters.read_count += contribution.read_count;
        self.counters.write_count += contribution.write_count;
        self.counters.filter_count += contribution.filter_count;
        self.counters.read_skip_count += contribution.read_skip_count;
        self.counters.process_skip_count += contribution.process_skip_count;
        self.counters.write_skip_count += contribution.write_skip_count;
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    /// The time used to order executions: start time, else create time.
    pub fn ordering_time(&self) -> DateTime<Utc> {
        self.start_time.unwrap_or(self.create_time)
    }
}

impl Versioned for StepExecution {
    fn version(&self) -> Option<u64> {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> JobInstance {
        JobInstance {
            id: JobInstanceId::new(1),
            job_name: "import".into(),
            job_key: JobParameters::new().job_key(),
            version: 0,
        }
    }

    #[test]
    fn step_execution_requires_saved_job_execution() {
        let mut execution = JobExecution::new(instance(), JobParameters::new());
        assert!(execution.create_step_execution("load").is_err());

        execution.id = Some(JobExecutionId::new(5));
        let step = execution.create_step_execution("load").unwrap();
        assert_eq!(step.job_execution_id, JobExecutionId::new(5));
        assert_eq!(step.job_instance_id, JobInstanceId::new(1));
        assert_eq!(step.status, BatchStatus::Starting);
        assert!(step.id.is_none() && step.version.is_none());
    }

    #[test]
    fn contribution_applies_to_counters() {
        let mut step = StepExecution::new("load", JobExecutionId::new(1), JobInstanceId::new(1));
        let mut contribution = StepContribution {
            read_count: 3,
            write_count: 2,
            process_skip_count: 1,
            ..Default::default()
        };
        step.apply(&contribution.take());
        assert!(contribution.is_empty());
        assert_eq!(step.counters.read_count, 3);
        assert_eq!(step.counters.write_count, 2);
        assert_eq!(step.skip_count(), 1);
    }

    #[test]
    fn job_takes_worst_step_status() {
        let mut execution = JobExecution::new(instance(), JobParameters::new());
        execution.id = Some(JobExecutionId::new(1));
        execution.start();

        let mut ok = execution.create_step_execution("a").unwrap();
        ok.status = BatchStatus::Completed;
        ok.exit_status = ExitStatus::completed();
        let mut bad = execution.create_step_execution("b").unwrap();
        bad.status = BatchStatus::Failed;
        bad.exit_status = ExitStatus::failed();

        execution.aggregate_step_statuses(&[ok, bad]);
        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.code(), ExitStatus::FAILED);
    }

    #[test]
    fn stop_only_affects_running_executions() {
        let mut execution = JobExecution::new(instance(), JobParameters::new());
        execution.start();
        execution.stop();
        assert!(execution.is_stopping());

        execution.status = BatchStatus::Completed;
        execution.stop();
        assert_eq!(execution.status, BatchStatus::Completed);
    }
}
