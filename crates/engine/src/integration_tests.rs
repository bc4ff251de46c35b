//! Integration tests for the chunk engine against the in-memory repository.
//!
//! Tests: Reader → Processor → Writer → Repository checkpoints
//!
//! Verifies:
//! - Skips, retries and no-rollback failures settle each item exactly once
//! - Restarts resume from the last committed checkpoint
//! - Stop requests end a step `STOPPED` at a chunk boundary
//! - Partitioned steps run, fold and restart their partitions

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use batchforge_core::{
        BatchStatus, ExecutionContext, JobExecution, JobExecutionId, JobParameters, StepExecution,
    };
    use batchforge_infra::{InMemoryJobRepository, JobRepository};
    use proptest::prelude::*;
    use thiserror::Error;

    use crate::error::Unrecoverable;
    use crate::item::{
        ItemProcessor, ItemReader, ItemWriter, ListItemReader, ListItemWriter, PassThroughProcessor,
    };
    use crate::listener::StepListener;
    use crate::partition::{
        LocalPartitionHandler, PartitionStep, RangePartitioner, StepExecutionSplitter, StepFactory,
    };
    use crate::policy::{FaultRules, RetryPolicy};
    use crate::restart::{RestartRules, prepare_step_execution};
    use crate::step::{ChunkStep, Step, StopSignal};
    use crate::transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};
    use crate::{StepConfig, StepSettings};

    #[derive(Debug, Error)]
    #[error("not a number: {0}")]
    struct NotANumber(String);

    #[derive(Debug, Error)]
    #[error("deadlock detected")]
    struct Deadlock;

    #[derive(Debug, Error)]
    #[error("duplicate key {0}")]
    struct DuplicateKey(i64);

    #[derive(Debug, Error)]
    #[error("corrupt line")]
    struct CorruptLine;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Input {
        Number(i64),
        Text(String),
    }

    fn setup() -> (Arc<InMemoryJobRepository>, JobExecution) {
        batchforge_observability::init_for_tests();
        let repository = Arc::new(InMemoryJobRepository::new());
        let job = repository
            .create_job_execution("import", &JobParameters::new().with_long("run", 1))
            .unwrap();
        (repository, job)
    }

    fn step_execution(repository: &InMemoryJobRepository, job: &JobExecution, name: &str) -> StepExecution {
        prepare_step_execution(
            repository,
            job.id.unwrap(),
            job.job_instance.id,
            name,
            RestartRules::default(),
            ExecutionContext::new(),
        )
        .unwrap()
        .expect("step should start")
    }

    /// Fail `job` and open the next execution of the same instance.
    fn restart(repository: &InMemoryJobRepository, job: &mut JobExecution) -> JobExecution {
        job.status = BatchStatus::Failed;
        repository.update_job_execution(job).unwrap();
        repository
            .create_job_execution(job.job_name(), &job.job_parameters)
            .unwrap()
    }

    fn numbers(range: std::ops::RangeInclusive<i64>) -> Vec<i64> {
        range.collect()
    }

    fn list_step(
        name: &str,
        settings: StepSettings,
        rules: FaultRules,
        items: Vec<i64>,
        writer: Arc<dyn ItemWriter<i64>>,
        repository: &Arc<InMemoryJobRepository>,
    ) -> ChunkStep<i64, i64> {
        ChunkStep::new(
            name,
            StepConfig::new(settings, rules).unwrap(),
            Box::new(ListItemReader::new(name, items)),
            Arc::new(PassThroughProcessor),
            writer,
            repository.clone(),
        )
    }

    #[derive(Default)]
    struct SkipRecorder {
        processed: Mutex<Vec<String>>,
    }

    impl StepListener<Input, i64> for SkipRecorder {
        fn on_skip_in_process(&self, item: &Input, _error: &anyhow::Error) -> anyhow::Result<()> {
            self.processed.lock().unwrap().push(format!("{item:?}"));
            Ok(())
        }
    }

    #[test]
    fn skippable_process_error_is_skipped_once() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "double");

        let items = vec![
            Input::Number(1),
            Input::Number(2),
            Input::Text("x".to_string()),
            Input::Number(4),
            Input::Number(5),
        ];
        let writer = Arc::new(ListItemWriter::<i64>::new());
        let recorder = Arc::new(SkipRecorder::default());
        let settings = StepSettings {
            skip_limit: 1,
            ..StepSettings::chunked(2).fault_tolerant()
        };
        let mut step = ChunkStep::new(
            "double",
            StepConfig::new(settings, FaultRules::new().skip::<NotANumber>()).unwrap(),
            Box::new(ListItemReader::new("double", items)),
            Arc::new(|input: &Input| -> anyhow::Result<Option<i64>> {
                match input {
                    Input::Number(n) => Ok(Some(n * 2)),
                    Input::Text(text) => Err(NotANumber(text.clone()).into()),
                }
            }),
            writer.clone(),
            repository.clone(),
        )
        .with_listener(recorder.clone());

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.code(), "COMPLETED");
        assert_eq!(writer.written(), vec![2, 4, 8, 10]);
        assert_eq!(execution.counters.read_count, 5);
        assert_eq!(execution.counters.process_skip_count, 1);
        assert_eq!(execution.counters.write_count, 4);
        assert_eq!(execution.counters.commit_count, 3);
        assert_eq!(execution.counters.rollback_count, 1);
        assert_eq!(*recorder.processed.lock().unwrap(), vec!["Text(\"x\")".to_string()]);

        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.counters, execution.counters);
    }

    #[test]
    fn exceeding_the_skip_limit_fails_the_step() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "double");

        let items = vec![
            Input::Number(1),
            Input::Number(2),
            Input::Text("a".to_string()),
            Input::Text("b".to_string()),
        ];
        let writer = Arc::new(ListItemWriter::<i64>::new());
        let settings = StepSettings {
            skip_limit: 1,
            ..StepSettings::chunked(2).fault_tolerant()
        };
        let mut step = ChunkStep::new(
            "double",
            StepConfig::new(settings, FaultRules::new().skip::<NotANumber>()).unwrap(),
            Box::new(ListItemReader::new("double", items)),
            Arc::new(|input: &Input| -> anyhow::Result<Option<i64>> {
                match input {
                    Input::Number(n) => Ok(Some(n * 2)),
                    Input::Text(text) => Err(NotANumber(text.clone()).into()),
                }
            }),
            writer.clone(),
            repository.clone(),
        );

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.code(), "FAILED");
        assert_eq!(writer.written(), vec![2, 4]);
        assert_eq!(execution.counters.commit_count, 1);
        assert_eq!(execution.counters.process_skip_count, 0);
        assert!(execution.failures[0].contains("skip limit of 1 exceeded"));
    }

    /// Fails its first `failures` calls, then writes.
    struct FlakyWriter {
        failures: AtomicU32,
        calls: AtomicU32,
        inner: ListItemWriter<i64>,
    }

    impl FlakyWriter {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                inner: ListItemWriter::new(),
            }
        }
    }

    impl ItemWriter<i64> for FlakyWriter {
        fn write(&self, items: &[i64]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Deadlock.into());
            }
            self.inner.write(items)
        }
    }

    #[test]
    fn retryable_write_succeeds_within_the_attempt_budget() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(FlakyWriter::new(2));
        let settings = StepSettings {
            retry: RetryPolicy::fixed(3, Duration::ZERO),
            ..StepSettings::chunked(4).fault_tolerant()
        };
        let mut step = list_step(
            "load",
            settings,
            FaultRules::new().retry::<Deadlock>(),
            numbers(1..=4),
            writer.clone(),
            &repository,
        );

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(writer.inner.written(), numbers(1..=4));
        assert_eq!(writer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.counters.rollback_count, 2);
        assert_eq!(execution.counters.commit_count, 1);
        assert_eq!(execution.counters.write_count, 4);
        assert_eq!(execution.skip_count(), 0);
    }

    #[test]
    fn retry_budget_exhausted_fails_the_step() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(FlakyWriter::new(u32::MAX));
        let settings = StepSettings {
            retry: RetryPolicy::fixed(2, Duration::ZERO),
            ..StepSettings::chunked(4).fault_tolerant()
        };
        let mut step = list_step(
            "load",
            settings,
            FaultRules::new().retry::<Deadlock>(),
            numbers(1..=4),
            writer.clone(),
            &repository,
        );

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(writer.inner.written().is_empty());
        assert!(execution.failures[0].contains("retry exhausted after 2 attempts"));
    }

    struct RejectDuplicate(i64);

    impl ItemWriter<i64> for RejectDuplicate {
        fn write(&self, items: &[i64]) -> anyhow::Result<()> {
            if items.contains(&self.0) {
                return Err(DuplicateKey(self.0).into());
            }
            Ok(())
        }
    }

    #[test]
    fn no_rollback_failure_commits_the_failed_chunk() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let transactions = Arc::new(ResourcelessTransactionManager::new());
        let mut step = list_step(
            "load",
            StepSettings::chunked(2).fault_tolerant(),
            FaultRules::new().no_rollback::<DuplicateKey>(),
            numbers(1..=6),
            Arc::new(RejectDuplicate(5)),
            &repository,
        )
        .with_transaction_manager(transactions.clone());

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.counters.commit_count, 2);
        assert_eq!(execution.counters.write_count, 4);
        assert_eq!(execution.counters.rollback_count, 0);
        assert_eq!(transactions.commits(), 3);
        assert_eq!(transactions.rollbacks(), 0);
    }

    #[test]
    fn fatal_errors_win_over_skip_rules() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let mut step: ChunkStep<i64, i64> = ChunkStep::new(
            "load",
            StepConfig::new(
                StepSettings::chunked(2).fault_tolerant(),
                FaultRules::new().skip_when(|_| true),
            )
            .unwrap(),
            Box::new(ListItemReader::new("load", numbers(1..=4))),
            Arc::new(|n: &i64| -> anyhow::Result<Option<i64>> {
                if *n == 3 {
                    return Err(Unrecoverable::new("disk gone").into());
                }
                Ok(Some(*n))
            }),
            writer.clone(),
            repository.clone(),
        );

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(writer.written(), vec![1, 2]);
        assert_eq!(execution.skip_count(), 0);
        assert!(execution.failures[0].contains("disk gone"));
    }

    #[test]
    fn restart_resumes_after_the_last_commit() {
        let (repository, mut job) = setup();
        let mut first = step_execution(&repository, &job, "load");

        let broken = Arc::new(AtomicBool::new(true));
        let processor: Arc<dyn ItemProcessor<i64, i64>> = {
            let broken = Arc::clone(&broken);
            Arc::new(move |n: &i64| -> anyhow::Result<Option<i64>> {
                if *n == 5 && broken.load(Ordering::SeqCst) {
                    return Err(Unrecoverable::new("downstream unavailable").into());
                }
                Ok(Some(*n))
            })
        };
        let writer = Arc::new(ListItemWriter::<i64>::new());
        let step = |processor: Arc<dyn ItemProcessor<i64, i64>>| {
            ChunkStep::new(
                "load",
                StepConfig::new(StepSettings::chunked(2), FaultRules::new()).unwrap(),
                Box::new(ListItemReader::new("load", numbers(1..=6))),
                processor,
                writer.clone(),
                repository.clone(),
            )
        };

        step(processor.clone()).execute(&mut first).unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(first.counters.commit_count, 2);

        let stored = repository.get_step_execution(first.id.unwrap()).unwrap().unwrap();
        let reloaded = ExecutionContext::from_json(&stored.execution_context.to_json().unwrap()).unwrap();
        assert_eq!(reloaded.get_i64("load.read.count"), Some(4));

        broken.store(false, Ordering::SeqCst);
        let next_job = restart(&repository, &mut job);
        let mut second = step_execution(&repository, &next_job, "load");
        assert_eq!(second.execution_context.get_i64("load.read.count"), Some(4));

        step(processor).execute(&mut second).unwrap();

        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.counters.write_count, 2);
        assert_eq!(writer.written(), numbers(1..=6));
    }

    #[test]
    fn completed_step_does_not_run_again() {
        let (repository, mut job) = setup();
        let mut first = step_execution(&repository, &job, "load");
        let writer = Arc::new(ListItemWriter::<i64>::new());
        list_step("load", StepSettings::chunked(3), FaultRules::new(), numbers(1..=3), writer.clone(), &repository)
            .execute(&mut first)
            .unwrap();
        assert_eq!(first.status, BatchStatus::Completed);

        let next_job = restart(&repository, &mut job);
        let prepared = prepare_step_execution(
            repository.as_ref(),
            next_job.id.unwrap(),
            next_job.job_instance.id,
            "load",
            RestartRules::default(),
            ExecutionContext::new(),
        )
        .unwrap();
        assert!(prepared.is_none());
    }

    struct StopAfterFirstChunk(StopSignal);

    impl StepListener<i64, i64> for StopAfterFirstChunk {
        fn after_chunk(&self) -> anyhow::Result<()> {
            self.0.stop();
            Ok(())
        }
    }

    #[test]
    fn stop_signal_ends_the_step_stopped() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let step = list_step("load", StepSettings::chunked(2), FaultRules::new(), numbers(1..=10), writer.clone(), &repository);
        let stop = step.stop_signal();
        let mut step = step.with_listener(Arc::new(StopAfterFirstChunk(stop)));

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.exit_status.code(), "STOPPED");
        assert_eq!(execution.counters.commit_count, 1);
        assert_eq!(writer.written(), vec![1, 2]);
        assert!(execution.failures.is_empty());
    }

    /// Requests a stop through the repository, the way an operator would.
    struct StopJob {
        repository: Arc<InMemoryJobRepository>,
        job_execution_id: JobExecutionId,
    }

    impl StepListener<i64, i64> for StopJob {
        fn after_chunk(&self) -> anyhow::Result<()> {
            let mut job = self
                .repository
                .get_job_execution(self.job_execution_id)?
                .ok_or_else(|| anyhow::anyhow!("job execution vanished"))?;
            if job.is_running() && !job.is_stopping() {
                job.stop();
                self.repository.update_job_execution(&mut job)?;
            }
            Ok(())
        }
    }

    #[test]
    fn stopping_job_stops_its_step_at_the_next_boundary() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let mut step = list_step("load", StepSettings::chunked(3), FaultRules::new(), numbers(1..=9), writer.clone(), &repository)
            .with_listener(Arc::new(StopJob {
                repository: repository.clone(),
                job_execution_id: job.id.unwrap(),
            }));

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(writer.written(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_workers_write_every_item_once() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let settings = StepSettings {
            throttle_limit: 4,
            ..StepSettings::chunked(5)
        };
        let mut step = list_step("load", settings, FaultRules::new(), numbers(1..=100), writer.clone(), &repository);

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        let mut written = writer.written();
        written.sort_unstable();
        assert_eq!(written, numbers(1..=100));
        assert_eq!(execution.counters.read_count, 100);
        assert_eq!(execution.counters.commit_count, 20);

        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.counters.write_count, 100);
    }

    #[test]
    fn concurrent_skips_respect_the_limit_exactly() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let settings = StepSettings {
            throttle_limit: 4,
            skip_limit: 5,
            ..StepSettings::chunked(2).fault_tolerant()
        };
        let mut step: ChunkStep<i64, i64> = ChunkStep::new(
            "load",
            StepConfig::new(settings, FaultRules::new().skip::<NotANumber>()).unwrap(),
            Box::new(ListItemReader::new("load", numbers(1..=40))),
            Arc::new(|n: &i64| -> anyhow::Result<Option<i64>> {
                if n % 4 == 0 {
                    return Err(NotANumber(n.to_string()).into());
                }
                Ok(Some(*n))
            }),
            writer.clone(),
            repository.clone(),
        );

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(execution.counters.process_skip_count <= 5);
        assert!(execution.failures.iter().any(|f| f.contains("skip limit of 5 exceeded")));
    }

    #[derive(Default)]
    struct Queue {
        items: Vec<i64>,
        cursor: usize,
        committed: usize,
        redelivered: usize,
    }

    /// A reader whose position is part of the chunk transaction.
    struct QueueReader(Arc<Mutex<Queue>>);

    impl ItemReader<i64> for QueueReader {
        fn read(&mut self) -> anyhow::Result<Option<i64>> {
            let mut queue = self.0.lock().unwrap();
            let item = queue.items.get(queue.cursor).copied();
            if item.is_some() {
                queue.cursor += 1;
            }
            Ok(item)
        }

        fn is_transactional(&self) -> bool {
            true
        }
    }

    struct QueueTransactions(Arc<Mutex<Queue>>);

    impl TransactionManager for QueueTransactions {
        fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
            Ok(Box::new(QueueTransaction(Arc::clone(&self.0))))
        }
    }

    struct QueueTransaction(Arc<Mutex<Queue>>);

    impl Transaction for QueueTransaction {
        fn commit(self: Box<Self>) -> anyhow::Result<()> {
            let mut queue = self.0.lock().unwrap();
            queue.committed = queue.cursor;
            Ok(())
        }

        fn rollback(self: Box<Self>) -> anyhow::Result<()> {
            let mut queue = self.0.lock().unwrap();
            queue.redelivered += queue.cursor - queue.committed;
            queue.cursor = queue.committed;
            Ok(())
        }
    }

    #[test]
    fn transactional_reader_redelivers_rolled_back_items() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "drain");

        let queue = Arc::new(Mutex::new(Queue {
            items: numbers(1..=5),
            ..Queue::default()
        }));
        let writer = Arc::new(FlakyWriter::new(1));
        let settings = StepSettings {
            retry: RetryPolicy::fixed(2, Duration::ZERO),
            ..StepSettings::chunked(2).fault_tolerant()
        };
        let mut step: ChunkStep<i64, i64> = ChunkStep::new(
            "drain",
            StepConfig::new(settings, FaultRules::new().retry::<Deadlock>()).unwrap(),
            Box::new(QueueReader(Arc::clone(&queue))),
            Arc::new(PassThroughProcessor),
            writer.clone(),
            repository.clone(),
        )
        .with_transaction_manager(Arc::new(QueueTransactions(Arc::clone(&queue))));

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(writer.inner.written(), numbers(1..=5));
        assert_eq!(execution.counters.rollback_count, 1);
        let queue = queue.lock().unwrap();
        assert_eq!(queue.redelivered, 2);
        assert_eq!(queue.committed, 5);
    }

    /// Reads its partition's `minValue..=maxValue`, optionally failing on one
    /// value while `broken` is set.
    struct RangeReader {
        next: i64,
        max: i64,
        fail_at: i64,
        broken: Arc<AtomicBool>,
    }

    impl ItemReader<i64> for RangeReader {
        fn read(&mut self) -> anyhow::Result<Option<i64>> {
            if self.next > self.max {
                return Ok(None);
            }
            if self.next == self.fail_at && self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("source offline at {}", self.next);
            }
            self.next += 1;
            Ok(Some(self.next - 1))
        }

        fn open(&mut self, context: &ExecutionContext) -> anyhow::Result<()> {
            let min = context
                .get_i64("minValue")
                .ok_or_else(|| anyhow::anyhow!("partition without minValue"))?;
            self.max = context
                .get_i64("maxValue")
                .ok_or_else(|| anyhow::anyhow!("partition without maxValue"))?;
            self.next = context.get_i64("range.next").unwrap_or(min);
            Ok(())
        }

        fn update(&mut self, context: &mut ExecutionContext) -> anyhow::Result<()> {
            context.put_i64("range.next", self.next);
            Ok(())
        }
    }

    fn range_factory(
        repository: &Arc<InMemoryJobRepository>,
        writer: &Arc<ListItemWriter<i64>>,
        broken: &Arc<AtomicBool>,
    ) -> StepFactory {
        let repository: Arc<dyn JobRepository> = repository.clone();
        let writer = Arc::clone(writer);
        let broken = Arc::clone(broken);
        Arc::new(move || -> Box<dyn Step> {
            Box::new(ChunkStep::new(
                "sum-worker",
                StepConfig::new(StepSettings::chunked(3), FaultRules::new()).unwrap(),
                Box::new(RangeReader {
                    next: 0,
                    max: -1,
                    fail_at: 15,
                    broken: Arc::clone(&broken),
                }),
                Arc::new(PassThroughProcessor),
                writer.clone(),
                Arc::clone(&repository),
            ))
        })
    }

    fn partition_step(repository: &Arc<InMemoryJobRepository>, factory: StepFactory, stop: StopSignal) -> PartitionStep {
        let splitter = StepExecutionSplitter::new(
            repository.clone(),
            "sum",
            Arc::new(RangePartitioner::new(1, 30)),
        );
        let handler = LocalPartitionHandler::new(factory, 3).with_stop_signal(stop);
        PartitionStep::new(splitter, Arc::new(handler))
    }

    #[test]
    fn partitioned_step_covers_the_whole_range() {
        let (repository, job) = setup();
        let mut manager = step_execution(&repository, &job, "sum");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let broken = Arc::new(AtomicBool::new(false));
        let factory = range_factory(&repository, &writer, &broken);

        partition_step(&repository, factory, StopSignal::new())
            .execute(&mut manager)
            .unwrap();

        assert_eq!(manager.status, BatchStatus::Completed);
        assert_eq!(manager.counters.write_count, 30);
        let mut written = writer.written();
        written.sort_unstable();
        assert_eq!(written, numbers(1..=30));

        let steps = repository.find_step_executions(job.id.unwrap()).unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|s| s.status == BatchStatus::Completed));
    }

    #[test]
    fn partitioned_restart_reruns_only_the_failed_partition() {
        let (repository, mut job) = setup();
        let mut manager = step_execution(&repository, &job, "sum");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let broken = Arc::new(AtomicBool::new(true));
        let factory = range_factory(&repository, &writer, &broken);

        partition_step(&repository, factory.clone(), StopSignal::new())
            .execute(&mut manager)
            .unwrap();
        assert_eq!(manager.status, BatchStatus::Failed);
        assert!(manager.failures.iter().any(|f| f.starts_with("sum:partition1")));

        broken.store(false, Ordering::SeqCst);
        let next_job = restart(&repository, &mut job);
        let mut restarted = step_execution(&repository, &next_job, "sum");
        partition_step(&repository, factory, StopSignal::new())
            .execute(&mut restarted)
            .unwrap();

        assert_eq!(restarted.status, BatchStatus::Completed);
        let rerun = repository.find_step_executions(next_job.id.unwrap()).unwrap();
        let names: Vec<_> = rerun.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["sum", "sum:partition1"]);

        let mut written = writer.written();
        written.sort_unstable();
        assert_eq!(written, numbers(1..=30));
    }

    #[test]
    fn stopped_handler_leaves_partitions_stopped() {
        let (repository, job) = setup();
        let mut manager = step_execution(&repository, &job, "sum");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let broken = Arc::new(AtomicBool::new(false));
        let stop = StopSignal::new();
        stop.stop();

        partition_step(&repository, range_factory(&repository, &writer, &broken), stop)
            .execute(&mut manager)
            .unwrap();

        assert_eq!(manager.status, BatchStatus::Stopped);
        assert!(writer.written().is_empty());
    }

    #[test]
    fn failure_keeps_the_whole_cause_chain() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let mut step: ChunkStep<i64, i64> = ChunkStep::new(
            "load",
            StepConfig::new(StepSettings::chunked(2), FaultRules::new()).unwrap(),
            Box::new(ListItemReader::new("load", numbers(1..=4))),
            Arc::new(|n: &i64| -> anyhow::Result<Option<i64>> {
                if *n == 3 {
                    return Err(anyhow::anyhow!("connection reset").context(format!("pricing item {n}")));
                }
                Ok(Some(*n))
            }),
            Arc::new(ListItemWriter::<i64>::new()),
            repository.clone(),
        );

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(execution.failures[0].ends_with("pricing item 3: connection reset"));
        assert!(execution.exit_status.description().contains("connection reset"));

        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.failures, execution.failures);
    }

    /// Records how many items it wrote in the step's context.
    #[derive(Default)]
    struct CountingWriter {
        written: AtomicI64,
        updates: AtomicU32,
    }

    impl ItemWriter<i64> for CountingWriter {
        fn write(&self, items: &[i64]) -> anyhow::Result<()> {
            self.written.fetch_add(items.len() as i64, Ordering::SeqCst);
            Ok(())
        }

        fn update(&self, context: &mut ExecutionContext) -> anyhow::Result<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            context.put_i64("writer.written", self.written.load(Ordering::SeqCst));
            Ok(())
        }
    }

    #[test]
    fn writer_state_is_saved_with_every_checkpoint() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(CountingWriter::default());
        let mut step = list_step("load", StepSettings::chunked(2), FaultRules::new(), numbers(1..=4), writer.clone(), &repository);

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        // One per committed chunk, one at the end.
        assert_eq!(writer.updates.load(Ordering::SeqCst), 3);
        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.execution_context.get_i64("writer.written"), Some(4));
        assert_eq!(stored.execution_context.get_i64("load.read.count"), Some(4));
    }

    #[test]
    fn concurrent_commits_save_writer_state() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(CountingWriter::default());
        let settings = StepSettings {
            throttle_limit: 2,
            ..StepSettings::chunked(2)
        };
        let mut step = list_step("load", settings, FaultRules::new(), numbers(1..=10), writer.clone(), &repository);

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert!(writer.updates.load(Ordering::SeqCst) >= 5);
        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.execution_context.get_i64("writer.written"), Some(10));
    }

    struct FailingErrorListener;

    impl StepListener<i64, i64> for FailingErrorListener {
        fn after_chunk_error(&self) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    #[test]
    fn after_chunk_error_listener_failure_is_recorded() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let mut step: ChunkStep<i64, i64> = ChunkStep::new(
            "load",
            StepConfig::new(StepSettings::chunked(2), FaultRules::new()).unwrap(),
            Box::new(ListItemReader::new("load", numbers(1..=4))),
            Arc::new(|n: &i64| -> anyhow::Result<Option<i64>> {
                if *n == 3 {
                    anyhow::bail!("bad item {n}");
                }
                Ok(Some(*n))
            }),
            Arc::new(ListItemWriter::<i64>::new()),
            repository.clone(),
        )
        .with_listener(Arc::new(FailingErrorListener));

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.failures.len(), 2);
        assert!(execution.failures.iter().any(|f| f.contains("bad item 3")));
        assert!(execution.failures.iter().any(|f| f.contains("listener exploded")));
        let description = execution.exit_status.description();
        assert!(description.contains("bad item 3"));
        assert!(description.contains("listener exploded"));
    }

    /// Yields `Err` for every `None` slot.
    struct Lines(std::vec::IntoIter<Option<i64>>);

    impl ItemReader<i64> for Lines {
        fn read(&mut self) -> anyhow::Result<Option<i64>> {
            match self.0.next() {
                Some(Some(n)) => Ok(Some(n)),
                Some(None) => Err(CorruptLine.into()),
                None => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct SkipCounter {
        read: AtomicU32,
        written: Mutex<Vec<i64>>,
    }

    impl StepListener<i64, i64> for SkipCounter {
        fn on_skip_in_read(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
            self.read.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_skip_in_write(&self, item: &i64, _error: &anyhow::Error) -> anyhow::Result<()> {
            self.written.lock().unwrap().push(*item);
            Ok(())
        }
    }

    #[test]
    fn skipped_read_is_announced_and_persisted() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "parse");

        let writer = Arc::new(ListItemWriter::<i64>::new());
        let skips = Arc::new(SkipCounter::default());
        let lines = vec![Some(1), Some(2), None, Some(4), Some(5)];
        let mut step: ChunkStep<i64, i64> = ChunkStep::new(
            "parse",
            StepConfig::new(
                StepSettings::chunked(2).fault_tolerant(),
                FaultRules::new().skip::<CorruptLine>(),
            )
            .unwrap(),
            Box::new(Lines(lines.into_iter())),
            Arc::new(PassThroughProcessor),
            writer.clone(),
            repository.clone(),
        )
        .with_listener(skips.clone());

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(writer.written(), vec![1, 2, 4, 5]);
        assert_eq!(skips.read.load(Ordering::SeqCst), 1);
        assert_eq!(execution.counters.read_count, 4);

        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.counters.read_skip_count, 1);
        assert_eq!(stored.counters.write_count, 4);
    }

    /// Rejects every batch that contains one particular item.
    struct RejectItem {
        item: i64,
        inner: ListItemWriter<i64>,
    }

    impl ItemWriter<i64> for RejectItem {
        fn write(&self, items: &[i64]) -> anyhow::Result<()> {
            if items.contains(&self.item) {
                return Err(DuplicateKey(self.item).into());
            }
            self.inner.write(items)
        }
    }

    #[test]
    fn scanned_write_skip_is_announced_per_item() {
        let (repository, job) = setup();
        let mut execution = step_execution(&repository, &job, "load");

        let writer = Arc::new(RejectItem {
            item: 3,
            inner: ListItemWriter::new(),
        });
        let skips = Arc::new(SkipCounter::default());
        let mut step = list_step(
            "load",
            StepSettings::chunked(3).fault_tolerant(),
            FaultRules::new().skip::<DuplicateKey>(),
            numbers(1..=6),
            writer.clone(),
            &repository,
        )
        .with_listener(skips.clone());

        step.execute(&mut execution).unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(writer.inner.written(), vec![1, 2, 4, 5, 6]);
        assert_eq!(*skips.written.lock().unwrap(), vec![3]);
        assert_eq!(execution.counters.write_skip_count, 1);
        assert_eq!(execution.counters.write_count, 5);

        let stored = repository.get_step_execution(execution.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.counters.write_skip_count, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: without failures every item is written once and the
        /// number of commits is the number of chunks.
        #[test]
        fn every_item_written_once(len in 0i64..60, chunk_size in 1usize..8) {
            let (repository, job) = setup();
            let mut execution = step_execution(&repository, &job, "load");
            let writer = Arc::new(ListItemWriter::<i64>::new());
            let items: Vec<i64> = (0..len).collect();

            list_step("load", StepSettings::chunked(chunk_size), FaultRules::new(), items.clone(), writer.clone(), &repository)
                .execute(&mut execution)
                .unwrap();

            prop_assert_eq!(execution.status, BatchStatus::Completed);
            prop_assert_eq!(writer.written(), items);
            prop_assert_eq!(execution.counters.commit_count, (len as u64).div_ceil(chunk_size as u64));
        }
    }
}
