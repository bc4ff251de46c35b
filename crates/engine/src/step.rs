//! The chunk-oriented step.
//!
//! Each iteration of the step loop is one chunk in one transaction:
//!
//! ```text
//! begin ─▶ read chunk ─▶ process + write ─▶ after_chunk ─▶ skip listeners ─▶ commit
//!                              │                                              │
//!                              └─ rollback ◀── replay the same chunk          └─▶ apply counters, checkpoint
//! ```
//!
//! Stop requests are honoured between chunks only; a chunk that has started
//! always ends in a commit or a failure.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batchforge_core::{BatchStatus, ExitStatus, StepContribution, StepExecution, describe_error};
use batchforge_infra::JobRepository;
use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use crate::chunk::{Chunk, SkipTally};
use crate::config::StepConfig;
use crate::error::{Phase, StepError};
use crate::item::{ItemProcessor, ItemReader, ItemWriter};
use crate::listener::{CompositeListener, StepListener};
use crate::monitor::ChunkMonitor;
use crate::processor::{ChunkError, ChunkProcessor, ProcessorParts};
use crate::provider::ChunkProvider;
use crate::restart::RestartRules;
use crate::retry_cache::{KeyGenerator, RetryContextCache, hash_key_generator};
use crate::transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};
use crate::worker;

/// A unit of work within a job.
pub trait Step: Send {
    fn name(&self) -> &str;

    fn restart_rules(&self) -> RestartRules {
        RestartRules::default()
    }

    /// Run the step against a saved execution.
    ///
    /// The outcome is recorded on `step` itself; an `Err` means the final
    /// state could not be persisted.
    fn execute(&mut self, step: &mut StepExecution) -> Result<(), StepError>;
}

/// Cooperative stop request, observed at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How one attempt at a chunk ended.
pub(crate) enum Outcome<I, O> {
    Committed {
        contribution: StepContribution,
        chunk: Chunk<I, O>,
    },
    /// The trailing empty read: committed, but not counted.
    EndOfInput,
    RolledBack {
        replay: Option<Chunk<I, O>>,
    },
}

pub(crate) struct Failure {
    pub error: StepError,
    pub rolled_back: bool,
    /// Raised by `after_chunk_error` while the chunk was being abandoned.
    pub listener_error: Option<StepError>,
}

impl Failure {
    fn new(error: StepError, rolled_back: bool) -> Self {
        Self {
            error,
            rolled_back,
            listener_error: None,
        }
    }
}

/// Record an error that did not decide the step's outcome but must not be lost.
pub(crate) fn record_secondary_failure(step: &mut StepExecution, context: &str, error: &StepError) {
    let description = describe_error(error);
    warn!(error = %description, "{context}");
    step.failures.push(description);
}

/// Everything one chunk attempt needs, shared by the serial loop and the
/// concurrent workers.
pub(crate) struct Pipeline<I, O> {
    pub provider: ChunkProvider<I>,
    pub processor: ChunkProcessor<I, O>,
    pub listener: CompositeListener<I, O>,
    pub transactions: Arc<dyn TransactionManager>,
    pub tally: SkipTally,
    pub buffering: bool,
}

impl<I, O: Clone> Pipeline<I, O> {
    /// Run one transaction: replay `pending`, or read a new chunk with `read`.
    pub fn attempt(
        &self,
        pending: Option<Chunk<I, O>>,
        read: impl FnOnce(&Self) -> Result<Chunk<I, O>, StepError>,
    ) -> Result<Outcome<I, O>, Failure> {
        self.listener
            .before_chunk()
            .map_err(|error| Failure::new(error, false))?;
        let tx = self.transactions.begin().map_err(|source| {
            Failure::new(
                StepError::Transaction {
                    operation: "begin",
                    source,
                },
                false,
            )
        })?;

        let mut chunk = match pending {
            Some(chunk) => chunk,
            None => match read(self) {
                Ok(chunk) => chunk,
                Err(error) => return Err(self.abandon(tx, error)),
            },
        };

        if chunk.is_idle() && chunk.is_end_of_input() {
            commit(tx).map_err(|error| Failure::new(error, false))?;
            return Ok(Outcome::EndOfInput);
        }

        match self.processor.process(&mut chunk, &self.listener, &self.tally) {
            Ok(contribution) => {
                let notified = self
                    .listener
                    .after_chunk()
                    .and_then(|()| chunk.notify_skips(&self.listener));
                if let Err(error) = notified {
                    return Err(self.abandon(tx, error));
                }
                commit(tx).map_err(|error| Failure::new(error, false))?;
                Ok(Outcome::Committed { contribution, chunk })
            }
            Err(ChunkError::Rollback { phase, message }) => {
                warn!(%phase, error = %message, "chunk rolled back");
                tx.rollback().map_err(|source| {
                    Failure::new(
                        StepError::Transaction {
                            operation: "rollback",
                            source,
                        },
                        false,
                    )
                })?;
                self.listener
                    .after_chunk_error()
                    .map_err(|error| Failure::new(error, true))?;
                Ok(Outcome::RolledBack {
                    replay: self.buffering.then_some(chunk),
                })
            }
            Err(ChunkError::Fatal(error)) => Err(self.abandon(tx, error)),
        }
    }

    /// Settle the transaction of a failed chunk. Errors whose cause must not
    /// roll back are committed.
    fn abandon(&self, tx: Box<dyn Transaction>, error: StepError) -> Failure {
        let rollback = error
            .cause()
            .is_none_or(|cause| self.processor.rollback_classifier().should_rollback(cause));
        let settled = if rollback { tx.rollback() } else { tx.commit() };
        if let Err(err) = settled {
            warn!(error = %err, rollback, "could not settle the transaction of a failed chunk");
        }
        Failure {
            error,
            rolled_back: rollback,
            listener_error: self.listener.after_chunk_error().err(),
        }
    }
}

/// Let the writer save its state into the step's context.
pub(crate) fn update_writer<O>(writer: &dyn ItemWriter<O>, step: &mut StepExecution) -> Result<(), StepError> {
    writer
        .update(&mut step.execution_context)
        .map_err(|source| StepError::Stream {
            operation: "update",
            source,
        })
}

fn commit(tx: Box<dyn Transaction>) -> Result<(), StepError> {
    tx.commit().map_err(|source| StepError::Transaction {
        operation: "commit",
        source,
    })
}

/// A read → process → write step.
pub struct ChunkStep<I, O> {
    name: String,
    config: StepConfig,
    reader: Box<dyn ItemReader<I>>,
    processor: Arc<dyn ItemProcessor<I, O>>,
    writer: Arc<dyn ItemWriter<O>>,
    repository: Arc<dyn JobRepository>,
    transactions: Arc<dyn TransactionManager>,
    listener: CompositeListener<I, O>,
    keys: KeyGenerator<I>,
    stop: StopSignal,
    monitor: ChunkMonitor,
}

impl<I, O> ChunkStep<I, O>
where
    I: Hash + Send + 'static,
    O: Clone + Send + 'static,
{
    /// Items are identified for retry by their hash.
    pub fn new(
        name: impl Into<String>,
        config: StepConfig,
        reader: Box<dyn ItemReader<I>>,
        processor: Arc<dyn ItemProcessor<I, O>>,
        writer: Arc<dyn ItemWriter<O>>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self::with_key_generator(name, config, reader, processor, writer, repository, hash_key_generator())
    }
}

impl<I, O> ChunkStep<I, O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    pub fn with_key_generator(
        name: impl Into<String>,
        config: StepConfig,
        reader: Box<dyn ItemReader<I>>,
        processor: Arc<dyn ItemProcessor<I, O>>,
        writer: Arc<dyn ItemWriter<O>>,
        repository: Arc<dyn JobRepository>,
        keys: KeyGenerator<I>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            reader,
            processor,
            writer,
            repository,
            transactions: Arc::new(ResourcelessTransactionManager::new()),
            listener: CompositeListener::new(),
            keys,
            stop: StopSignal::new(),
            monitor: ChunkMonitor::new(),
        }
    }

    pub fn with_transaction_manager(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn StepListener<I, O>>) -> Self {
        self.listener.register(listener);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    fn pipeline(&self, step: &StepExecution) -> Pipeline<I, O> {
        let settings = self.config.settings();
        let buffering = !self.reader.is_transactional();
        Pipeline {
            provider: ChunkProvider::new(
                self.config.completion(),
                self.config.skip_policy(Phase::Read),
                settings.fault_tolerant,
                self.config.max_skips_on_read(),
                Arc::clone(&self.keys),
            ),
            processor: ChunkProcessor::new(ProcessorParts {
                processor: Arc::clone(&self.processor),
                writer: Arc::clone(&self.writer),
                retry: self.config.retry_policy(),
                process_skip: self.config.skip_policy(Phase::Process),
                write_skip: self.config.skip_policy(Phase::Write),
                rollback: self.config.rollback_classifier(),
                cache: Arc::new(RetryContextCache::new(settings.retry_cache_capacity)),
                fault_tolerant: settings.fault_tolerant,
                processor_transactional: settings.processor_transactional,
                buffering,
            }),
            listener: self.listener.clone(),
            transactions: Arc::clone(&self.transactions),
            tally: SkipTally::from_counters(&step.counters),
            buffering,
        }
    }

    fn open_streams(&mut self, step: &StepExecution) -> Result<(), StepError> {
        self.monitor = ChunkMonitor::new();
        self.monitor.open(self.reader.as_mut(), &step.execution_context)?;
        self.writer
            .open(&step.execution_context)
            .map_err(|source| StepError::Stream {
                operation: "open",
                source,
            })
    }

    fn close_streams(&mut self) -> Result<(), StepError> {
        let reader = self.reader.close();
        let writer = self.writer.close();
        reader.and(writer).map_err(|source| StepError::Stream {
            operation: "close",
            source,
        })
    }

    fn start(&mut self, step: &mut StepExecution) -> Result<(), StepError> {
        self.listener.before_step(step)?;
        self.open_streams(step)?;
        step.status = BatchStatus::Started;
        self.repository.update_step_execution(step)?;
        info!(throttle_limit = self.config.throttle_limit(), "step started");

        let pipeline = self.pipeline(step);
        let throttle = self.config.throttle_limit();
        if throttle > 1 {
            worker::run_concurrent(
                &pipeline,
                throttle,
                self.reader.as_mut(),
                self.writer.as_ref(),
                step,
                self.repository.as_ref(),
                &self.stop,
            )
        } else {
            self.run_serial(&pipeline, step)
        }
    }

    fn run_serial(&mut self, pipeline: &Pipeline<I, O>, step: &mut StepExecution) -> Result<(), StepError> {
        let mut pending: Option<Chunk<I, O>> = None;

        loop {
            if pending.is_none() && (self.stop.is_stopped() || step.terminate_only) {
                return Err(StepError::Interrupted);
            }

            let reader = self.reader.as_mut();
            let monitor = &mut self.monitor;
            let outcome = pipeline.attempt(pending.take(), |p| {
                monitor.mark(&mut *reader)?;
                p.provider.provide(&mut *reader, &p.listener, &p.tally)
            });

            match outcome {
                Ok(Outcome::Committed { contribution, chunk }) => {
                    step.apply(&contribution);
                    step.counters.commit_count += 1;
                    self.monitor
                        .checkpoint(self.reader.as_mut(), &chunk, &mut step.execution_context)?;
                    update_writer(self.writer.as_ref(), step)?;
                    self.repository.checkpoint_step_execution(step)?;
                    debug!(
                        commits = step.counters.commit_count,
                        written = step.counters.write_count,
                        "chunk committed"
                    );
                    if !chunk.is_finished() {
                        pending = Some(chunk);
                    } else if chunk.is_end_of_input() {
                        return Ok(());
                    }
                }
                Ok(Outcome::EndOfInput) => return Ok(()),
                Ok(Outcome::RolledBack { replay }) => {
                    step.counters.rollback_count += 1;
                    pending = replay;
                }
                Err(Failure {
                    error,
                    rolled_back,
                    listener_error,
                }) => {
                    if rolled_back {
                        step.counters.rollback_count += 1;
                    }
                    if let Some(listener_error) = listener_error {
                        record_secondary_failure(step, "after_chunk_error listener failed", &listener_error);
                    }
                    return Err(error);
                }
            }
        }
    }
}

impl<I, O> Step for ChunkStep<I, O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn restart_rules(&self) -> RestartRules {
        self.config.restart_rules()
    }

    fn execute(&mut self, step: &mut StepExecution) -> Result<(), StepError> {
        let span = info_span!("step", name = %step.step_name, execution_id = ?step.id);
        let _entered = span.enter();
        step.start_time = Some(Utc::now());

        let recorded = step.failures.len();
        let outcome = self.start(step);
        let (status, mut exit_status) = match &outcome {
            Ok(()) => (BatchStatus::Completed, ExitStatus::completed()),
            Err(StepError::Interrupted) => (BatchStatus::Stopped, ExitStatus::stopped()),
            Err(err @ StepError::Repository(_)) => (BatchStatus::Unknown, ExitStatus::unknown().with_error(err)),
            Err(err) => (BatchStatus::Failed, ExitStatus::failed().with_error(err)),
        };
        for secondary in &step.failures[recorded..] {
            exit_status = exit_status.with_description(secondary);
        }
        step.status = status;
        if let Err(err) = &outcome {
            if !matches!(err, StepError::Interrupted) {
                let description = describe_error(err);
                error!(error = %description, "step failed");
                step.failures.push(description);
            }
        }

        // The writer's state is saved only when every chunk it saw was committed.
        if matches!(step.status, BatchStatus::Completed | BatchStatus::Stopped) {
            if let Err(err) = update_writer(self.writer.as_ref(), step) {
                error!(error = %describe_error(&err), "could not save writer state");
                step.status = BatchStatus::Failed;
                exit_status = exit_status.and(ExitStatus::failed().with_error(&err));
                step.failures.push(describe_error(&err));
            }
        }

        if let Err(err) = self.close_streams() {
            warn!(error = %describe_error(&err), "could not close streams");
            if step.status == BatchStatus::Completed {
                step.status = BatchStatus::Failed;
            }
            exit_status = exit_status.and(ExitStatus::failed().with_error(&err));
            step.failures.push(describe_error(&err));
        }

        step.exit_status = exit_status.clone();
        match self.listener.after_step(step) {
            Ok(Some(contributed)) => exit_status = exit_status.and(contributed),
            Ok(None) => {}
            Err(err) => {
                step.status = step.status.upgrade_to(BatchStatus::Failed);
                exit_status = exit_status.and(ExitStatus::failed().with_error(&err));
                step.failures.push(describe_error(&err));
            }
        }
        step.exit_status = exit_status;
        step.end_time = Some(Utc::now());

        if let Err(err) = self.repository.checkpoint_step_execution(step) {
            error!(error = %err, "could not persist the final step state");
            step.status = BatchStatus::Unknown;
            return Err(err.into());
        }

        info!(
            status = step.status.as_str(),
            exit_code = step.exit_status.code(),
            read = step.counters.read_count,
            written = step.counters.write_count,
            skipped = step.skip_count(),
            commits = step.counters.commit_count,
            rollbacks = step.counters.rollback_count,
            "step finished"
        );
        Ok(())
    }
}
