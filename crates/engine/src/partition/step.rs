use std::sync::Arc;

use batchforge_core::{BatchStatus, ExitStatus, StepExecution, describe_error};
use chrono::Utc;
use tracing::{error, info, info_span};

use crate::error::StepError;
use crate::restart::RestartRules;
use crate::step::Step;

use super::aggregator::{DefaultAggregator, StepExecutionAggregator};
use super::handler::PartitionHandler;
use super::splitter::StepExecutionSplitter;

/// A step that runs as independent partitions and reports their folded
/// result as its own.
pub struct PartitionStep {
    name: String,
    splitter: StepExecutionSplitter,
    handler: Arc<dyn PartitionHandler>,
    aggregator: Arc<dyn StepExecutionAggregator>,
    rules: RestartRules,
}

impl PartitionStep {
    pub fn new(splitter: StepExecutionSplitter, handler: Arc<dyn PartitionHandler>) -> Self {
        Self {
            name: splitter.step_name().to_string(),
            splitter,
            handler,
            aggregator: Arc::new(DefaultAggregator),
            rules: RestartRules::default(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn StepExecutionAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Restart rules of the manager step itself.
    pub fn with_restart_rules(mut self, rules: RestartRules) -> Self {
        self.rules = rules;
        self
    }

    fn run(&self, manager: &mut StepExecution) -> Result<(), StepError> {
        manager.status = BatchStatus::Started;
        self.splitter.repository().update_step_execution(manager)?;
        let partitions = self.handler.handle(&self.splitter, manager)?;
        self.aggregator.aggregate(manager, &partitions)?;
        // Everything may have completed in an earlier run.
        if partitions.is_empty() {
            manager.status = BatchStatus::Completed;
            manager.exit_status = ExitStatus::completed();
        }
        Ok(())
    }
}

impl Step for PartitionStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn restart_rules(&self) -> RestartRules {
        self.rules
    }

    fn execute(&mut self, manager: &mut StepExecution) -> Result<(), StepError> {
        let span = info_span!("partitioned_step", name = %manager.step_name, execution_id = ?manager.id);
        let _entered = span.enter();
        manager.start_time = Some(Utc::now());

        if let Err(err) = self.run(manager) {
            let description = describe_error(&err);
            error!(error = %description, "partitioned step failed");
            manager.status = match err {
                StepError::Repository(_) => BatchStatus::Unknown,
                _ => BatchStatus::Failed,
            };
            manager.exit_status = ExitStatus::failed().with_error(&err);
            manager.failures.push(description);
        }
        manager.end_time = Some(Utc::now());

        if let Err(err) = self.splitter.repository().checkpoint_step_execution(manager) {
            error!(error = %err, "could not persist the manager step");
            manager.status = BatchStatus::Unknown;
            return Err(err.into());
        }
        info!(
            status = manager.status.as_str(),
            written = manager.counters.write_count,
            "partitioned step finished"
        );
        Ok(())
    }
}
