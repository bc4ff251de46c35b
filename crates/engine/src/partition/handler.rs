//! Running partitions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use batchforge_core::{BatchStatus, ExitStatus, StepExecution, describe_error};
use chrono::Utc;
use tracing::{info, warn};

use crate::error::StepError;
use crate::step::{Step, StopSignal};

use super::splitter::StepExecutionSplitter;

/// Builds a fresh step for every partition.
pub type StepFactory = Arc<dyn Fn() -> Box<dyn Step> + Send + Sync>;

pub trait PartitionHandler: Send + Sync {
    /// Split `manager`, run every partition and return their final
    /// executions.
    fn handle(
        &self,
        splitter: &StepExecutionSplitter,
        manager: &mut StepExecution,
    ) -> Result<Vec<StepExecution>, StepError>;
}

/// Runs partitions on a bounded set of local threads and waits for all of
/// them.
pub struct LocalPartitionHandler {
    factory: StepFactory,
    grid_size: usize,
    throttle_limit: usize,
    stop: StopSignal,
}

impl LocalPartitionHandler {
    pub fn new(factory: StepFactory, grid_size: usize) -> Self {
        Self {
            factory,
            grid_size,
            throttle_limit: grid_size.max(1),
            stop: StopSignal::new(),
        }
    }

    pub fn with_throttle_limit(mut self, throttle_limit: usize) -> Self {
        self.throttle_limit = throttle_limit.max(1);
        self
    }

    /// Partitions that have not started when the signal is raised end
    /// `STOPPED` without running.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    fn run_partition(&self, splitter: &StepExecutionSplitter, mut execution: StepExecution) -> StepExecution {
        if self.stop.is_stopped() {
            info!(partition = %execution.step_name, "stop requested, partition not started");
            execution.status = BatchStatus::Stopped;
            execution.exit_status = ExitStatus::stopped().with_description("stopped before start");
            execution.end_time = Some(Utc::now());
            if let Err(err) = splitter.repository().update_step_execution(&mut execution) {
                warn!(partition = %execution.step_name, error = %err, "could not persist stopped partition");
                execution.status = BatchStatus::Unknown;
            }
            return execution;
        }

        let mut step = (self.factory)();
        if let Err(err) = step.execute(&mut execution) {
            let description = describe_error(&err);
            warn!(partition = %execution.step_name, error = %description, "partition ended in an unknown state");
            execution.status = BatchStatus::Unknown;
            execution.failures.push(description);
        }
        execution
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PartitionHandler for LocalPartitionHandler {
    fn handle(
        &self,
        splitter: &StepExecutionSplitter,
        manager: &mut StepExecution,
    ) -> Result<Vec<StepExecution>, StepError> {
        let queue = Mutex::new(splitter.split(manager, self.grid_size)?.into_iter().collect::<VecDeque<_>>());
        let finished = Mutex::new(Vec::new());
        let workers = self.throttle_limit.min(lock(&queue).len());

        thread::scope(|scope| -> Result<(), StepError> {
            for worker in 0..workers {
                let queue = &queue;
                let finished = &finished;
                thread::Builder::new()
                    .name(format!("partition-{worker}"))
                    .spawn_scoped(scope, move || {
                        loop {
                            let next = lock(queue).pop_front();
                            let Some(execution) = next else { break };
                            let done = self.run_partition(splitter, execution);
                            lock(finished).push(done);
                        }
                    })
                    .map_err(|err| StepError::Partition(format!("could not spawn partition worker: {err}")))?;
            }
            Ok(())
        })?;

        let mut finished = finished.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.sort_by_key(|execution| execution.id);
        Ok(finished)
    }
}
