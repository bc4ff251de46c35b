//! Materialises the partition step executions of a manager step.

use std::sync::Arc;

use batchforge_core::StepExecution;
use batchforge_infra::JobRepository;
use tracing::{debug, info};

use crate::error::StepError;
use crate::restart::{RestartRules, prepare_step_execution};

use super::partitioner::Partitioner;

/// Manager context key remembering the grid size, so a restart splits the
/// same way.
pub const GRID_SIZE_KEY: &str = "StepExecutionSplitter.GRID_SIZE";

pub struct StepExecutionSplitter {
    repository: Arc<dyn JobRepository>,
    step_name: String,
    partitioner: Arc<dyn Partitioner>,
    rules: RestartRules,
}

impl StepExecutionSplitter {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        step_name: impl Into<String>,
        partitioner: Arc<dyn Partitioner>,
    ) -> Self {
        Self {
            repository,
            step_name: step_name.into(),
            partitioner,
            rules: RestartRules::default(),
        }
    }

    /// Restart rules applied to every partition.
    pub fn with_restart_rules(mut self, rules: RestartRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Create and save one execution per partition that should run.
    ///
    /// Partitions completed by an earlier job execution are left out unless
    /// the restart rules allow them to start again; partitions that failed or
    /// stopped restart from their own context.
    pub fn split(&self, manager: &mut StepExecution, grid_size: usize) -> Result<Vec<StepExecution>, StepError> {
        let grid_size = match manager.execution_context.get_i64(GRID_SIZE_KEY) {
            Some(remembered) => {
                debug!(remembered, "reusing grid size of the previous run");
                usize::try_from(remembered)
                    .map_err(|_| StepError::Partition(format!("invalid grid size {remembered} in context")))?
            }
            None => {
                manager.execution_context.put_i64(GRID_SIZE_KEY, grid_size as i64);
                self.repository.update_step_execution_context(manager)?;
                grid_size
            }
        };

        let mut executions = Vec::new();
        for (partition, seed) in self.partitioner.partition(grid_size) {
            let name = format!("{}:{partition}", self.step_name);
            if let Some(execution) = prepare_step_execution(
                self.repository.as_ref(),
                manager.job_execution_id,
                manager.job_instance_id,
                &name,
                self.rules,
                seed,
            )? {
                executions.push(execution);
            }
        }
        info!(
            step = %self.step_name,
            grid_size,
            partitions = executions.len(),
            "step split into partitions"
        );
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use batchforge_core::{BatchStatus, JobParameters};
    use batchforge_infra::InMemoryJobRepository;

    use crate::partition::partitioner::{RangePartitioner, SimplePartitioner};

    use super::*;

    fn manager(repository: &Arc<InMemoryJobRepository>) -> StepExecution {
        let job = repository
            .create_job_execution("reindex", &JobParameters::new())
            .unwrap();
        let mut manager = StepExecution::new("index", job.id.unwrap(), job.job_instance.id);
        repository.save_step_execution(&mut manager).unwrap();
        manager
    }

    #[test]
    fn partitions_are_named_and_saved() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let mut manager = manager(&repository);
        let splitter = StepExecutionSplitter::new(repository.clone(), "index", Arc::new(RangePartitioner::new(1, 6)));

        let executions = splitter.split(&mut manager, 2).unwrap();
        let names: Vec<_> = executions.iter().map(|e| e.step_name.as_str()).collect();
        assert_eq!(names, vec!["index:partition0", "index:partition1"]);
        assert!(executions.iter().all(|e| e.id.is_some()));
        assert_eq!(executions[1].execution_context.get_i64("minValue"), Some(4));
        assert_eq!(manager.execution_context.get_i64(GRID_SIZE_KEY), Some(2));
    }

    #[test]
    fn remembered_grid_size_wins() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let mut manager = manager(&repository);
        manager.execution_context.put_i64(GRID_SIZE_KEY, 3);
        let splitter = StepExecutionSplitter::new(repository.clone(), "index", Arc::new(SimplePartitioner));
        assert_eq!(splitter.split(&mut manager, 8).unwrap().len(), 3);
    }

    #[test]
    fn completed_partitions_are_not_split_again() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let mut manager = manager(&repository);
        let splitter = StepExecutionSplitter::new(repository.clone(), "index", Arc::new(SimplePartitioner));
        let mut first = splitter.split(&mut manager, 2).unwrap();
        for (execution, status) in first.iter_mut().zip([BatchStatus::Completed, BatchStatus::Failed]) {
            execution.status = status;
            repository.update_step_execution(execution).unwrap();
        }
        manager.status = BatchStatus::Failed;
        repository.update_step_execution(&mut manager).unwrap();

        let mut job = repository.get_job_execution(manager.job_execution_id).unwrap().unwrap();
        job.status = BatchStatus::Failed;
        repository.update_job_execution(&mut job).unwrap();
        let restarted_job = repository
            .create_job_execution("reindex", &JobParameters::new())
            .unwrap();
        let mut restarted = StepExecution::new("index", restarted_job.id.unwrap(), restarted_job.job_instance.id);
        restarted.execution_context = manager.execution_context.clone();
        repository.save_step_execution(&mut restarted).unwrap();

        let again = splitter.split(&mut restarted, 2).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].step_name, "index:partition1");
    }
}
