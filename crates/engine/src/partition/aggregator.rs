//! Folding partition results into the manager execution.

use std::sync::Arc;

use batchforge_core::{BatchStatus, ExitStatus, StepExecution};
use batchforge_infra::JobRepository;

use crate::error::StepError;

pub trait StepExecutionAggregator: Send + Sync {
    fn aggregate(&self, manager: &mut StepExecution, partitions: &[StepExecution]) -> Result<(), StepError>;
}

/// Worst status wins (`FAILED` over `STOPPED` over `COMPLETED`), exit
/// statuses are combined and counters summed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAggregator;

impl StepExecutionAggregator for DefaultAggregator {
    fn aggregate(&self, manager: &mut StepExecution, partitions: &[StepExecution]) -> Result<(), StepError> {
        if partitions.is_empty() {
            return Ok(());
        }
        let mut status = BatchStatus::Starting;
        let mut exit_status = ExitStatus::executing();
        for partition in partitions {
            status = status.upgrade_to(partition.status);
            exit_status = exit_status.and(partition.exit_status.clone());
            manager.counters.accumulate(&partition.counters);
            manager
                .failures
                .extend(partition.failures.iter().map(|f| format!("{}: {f}", partition.step_name)));
        }
        manager.status = status;
        manager.exit_status = exit_status;
        Ok(())
    }
}

/// Reloads every partition from the repository before aggregating, for
/// partitions whose in-memory copy may be stale.
#[derive(Clone)]
pub struct RemoteStepExecutionAggregator {
    repository: Arc<dyn JobRepository>,
    delegate: DefaultAggregator,
}

impl RemoteStepExecutionAggregator {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            delegate: DefaultAggregator,
        }
    }
}

impl StepExecutionAggregator for RemoteStepExecutionAggregator {
    fn aggregate(&self, manager: &mut StepExecution, partitions: &[StepExecution]) -> Result<(), StepError> {
        let mut refreshed = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let id = partition
                .id
                .ok_or_else(|| StepError::Partition(format!("partition {} was never saved", partition.step_name)))?;
            let stored = self
                .repository
                .get_step_execution(id)?
                .ok_or_else(|| StepError::Partition(format!("partition {} not found", partition.step_name)))?;
            refreshed.push(stored);
        }
        self.delegate.aggregate(manager, &refreshed)
    }
}

#[cfg(test)]
mod tests {
    use batchforge_core::{JobExecutionId, JobInstanceId};

    use super::*;

    fn execution(name: &str, status: BatchStatus, written: u64) -> StepExecution {
        let mut execution = StepExecution::new(name, JobExecutionId::new(1), JobInstanceId::new(1));
        execution.status = status;
        execution.exit_status = ExitStatus::new(status.as_str());
        execution.counters.write_count = written;
        execution
    }

    #[test]
    fn every_status_combination_of_three_partitions() {
        use BatchStatus::{Completed, Failed, Stopped};
        let outcomes = [Completed, Failed, Stopped];

        for a in outcomes {
            for b in outcomes {
                for c in outcomes {
                    let statuses = [a, b, c];
                    let partitions: Vec<_> = statuses
                        .iter()
                        .enumerate()
                        .map(|(i, s)| execution(&format!("p{i}"), *s, 2))
                        .collect();
                    let mut manager = execution("manager", BatchStatus::Started, 0);

                    DefaultAggregator.aggregate(&mut manager, &partitions).unwrap();

                    let expected = if statuses.contains(&Failed) {
                        Failed
                    } else if statuses.contains(&Stopped) {
                        Stopped
                    } else {
                        Completed
                    };
                    assert_eq!(manager.status, expected, "partitions {statuses:?}");
                    assert_eq!(manager.exit_status.code(), expected.as_str());
                    assert_eq!(manager.counters.write_count, 6);
                }
            }
        }
    }

    #[test]
    fn no_partitions_leaves_manager_untouched() {
        let mut manager = execution("manager", BatchStatus::Started, 0);
        DefaultAggregator.aggregate(&mut manager, &[]).unwrap();
        assert_eq!(manager.status, BatchStatus::Started);
    }
}
