//! Transform and write a chunk under the fault policies.
//!
//! Without fault tolerance every item error ends the step. With it, each
//! attempt runs inside the caller's transaction:
//!
//! | outcome of an attempt            | what the caller does               |
//! |----------------------------------|------------------------------------|
//! | `Ok(contribution)`               | commit, apply the contribution     |
//! | `Err(ChunkError::Rollback)`      | roll back, replay the same chunk   |
//! | `Err(ChunkError::Fatal)`         | fail the step                      |
//!
//! Failures are registered in the [`RetryContextCache`] under the item key
//! (process) or the key of the whole output batch (write). A replay that finds
//! its key exhausted recovers the item through the skip policy instead of
//! calling the collaborator again. An exhausted batch write switches the chunk
//! to scanning: one item per transaction until the bad item is found.

use std::sync::Arc;
use std::thread;

use batchforge_core::StepContribution;
use tracing::{debug, warn};

use crate::chunk::{Chunk, Entry, SkipRecord, SkipTally};
use crate::error::{ForceRollbackForWriteSkip, Phase, StepError, is_fatal};
use crate::item::{ItemProcessor, ItemWriter};
use crate::listener::CompositeListener;
use crate::policy::{RetryPolicy, RollbackClassifier, SkipPolicy};
use crate::retry_cache::{ItemKey, RetryContext, RetryContextCache, RetryState};

/// How one attempt at a chunk ended, when it did not commit.
#[derive(Debug)]
pub enum ChunkError {
    /// Roll the transaction back and replay the chunk.
    Rollback { phase: Phase, message: String },
    Fatal(StepError),
}

impl From<StepError> for ChunkError {
    fn from(err: StepError) -> Self {
        ChunkError::Fatal(err)
    }
}

enum Transformed<O> {
    Output(O),
    Filtered,
    /// Skipped for good; the error goes to the skip listeners.
    Skipped(anyhow::Error),
}

pub struct ChunkProcessor<I, O> {
    processor: Arc<dyn ItemProcessor<I, O>>,
    writer: Arc<dyn ItemWriter<O>>,
    retry: RetryPolicy,
    process_skip: Arc<dyn SkipPolicy>,
    write_skip: Arc<dyn SkipPolicy>,
    rollback: RollbackClassifier,
    cache: Arc<RetryContextCache>,
    fault_tolerant: bool,
    processor_transactional: bool,
    /// The chunk is kept across rollbacks; false for transactional readers.
    buffering: bool,
}

/// Collaborators and policies of a [`ChunkProcessor`].
pub struct ProcessorParts<I, O> {
    pub processor: Arc<dyn ItemProcessor<I, O>>,
    pub writer: Arc<dyn ItemWriter<O>>,
    pub retry: RetryPolicy,
    pub process_skip: Arc<dyn SkipPolicy>,
    pub write_skip: Arc<dyn SkipPolicy>,
    pub rollback: RollbackClassifier,
    pub cache: Arc<RetryContextCache>,
    pub fault_tolerant: bool,
    pub processor_transactional: bool,
    pub buffering: bool,
}

impl<I, O: Clone> ChunkProcessor<I, O> {
    pub fn new(parts: ProcessorParts<I, O>) -> Self {
        Self {
            processor: parts.processor,
            writer: parts.writer,
            retry: parts.retry,
            process_skip: parts.process_skip,
            write_skip: parts.write_skip,
            rollback: parts.rollback,
            cache: parts.cache,
            fault_tolerant: parts.fault_tolerant,
            processor_transactional: parts.processor_transactional,
            buffering: parts.buffering,
        }
    }

    pub fn rollback_classifier(&self) -> &RollbackClassifier {
        &self.rollback
    }

    /// Run one attempt at `chunk`.
    ///
    /// On success every entry has been written, filtered or skipped, and the
    /// returned contribution includes the counters the chunk carried over
    /// from earlier attempts.
    pub fn process(
        &self,
        chunk: &mut Chunk<I, O>,
        listener: &CompositeListener<I, O>,
        tally: &SkipTally,
    ) -> Result<StepContribution, ChunkError> {
        if !self.fault_tolerant {
            return self.process_simple(chunk, listener).map_err(ChunkError::Fatal);
        }
        if chunk.scanning {
            return self.scan(chunk, listener, tally);
        }
        self.process_fault_tolerant(chunk, listener, tally)
    }

    fn process_simple(
        &self,
        chunk: &mut Chunk<I, O>,
        listener: &CompositeListener<I, O>,
    ) -> Result<StepContribution, StepError> {
        let mut outputs = Vec::with_capacity(chunk.entries.len());
        let mut filtered = 0u64;

        for entry in &chunk.entries {
            listener.before_process(&entry.item)?;
            match self.processor.process(&entry.item) {
                Ok(result) => {
                    listener.after_process(&entry.item, result.as_ref())?;
                    match result {
                        Some(output) => outputs.push(output),
                        None => filtered += 1,
                    }
                }
                Err(err) => {
                    listener.on_process_error(&entry.item, &err)?;
                    return Err(StepError::escalate(Phase::Process, err));
                }
            }
        }

        if !outputs.is_empty() {
            listener.before_write(&outputs)?;
            if let Err(err) = self.writer.write(&outputs) {
                listener.on_write_error(&outputs, &err)?;
                return Err(StepError::escalate(Phase::Write, err));
            }
            listener.after_write(&outputs)?;
        }

        let mut contribution = chunk.contribution.take();
        contribution.write_count += outputs.len() as u64;
        contribution.filter_count += filtered;
        chunk.entries.clear();
        Ok(contribution)
    }

    fn process_fault_tolerant(
        &self,
        chunk: &mut Chunk<I, O>,
        listener: &CompositeListener<I, O>,
        tally: &SkipTally,
    ) -> Result<StepContribution, ChunkError> {
        let mut outputs = Vec::with_capacity(chunk.entries.len());
        let mut keys = Vec::with_capacity(chunk.entries.len());
        let mut filtered = 0u64;

        let mut index = 0;
        while index < chunk.entries.len() {
            match self.transform(&mut chunk.entries[index], listener, tally)? {
                Transformed::Output(output) => {
                    keys.push(chunk.entries[index].key.clone());
                    outputs.push(output);
                    index += 1;
                }
                Transformed::Filtered => {
                    filtered += 1;
                    index += 1;
                }
                Transformed::Skipped(err) => {
                    let entry = chunk.entries.remove(index);
                    chunk.contribution.process_skip_count += 1;
                    chunk.skips.push(SkipRecord::Process(entry.item, err));
                }
            }
        }

        if outputs.is_empty() {
            return Ok(self.finish(chunk, 0, filtered));
        }

        let batch = ItemKey::Batch(keys);
        if self.cache.is_exhausted(&batch) {
            if let Some(context) = self.cache.take(&batch) {
                return self.recover_write(chunk, outputs, filtered, context, listener, tally);
            }
        }

        listener.before_write(&outputs)?;
        match self.writer.write(&outputs) {
            Ok(()) => {
                listener.after_write(&outputs)?;
                self.cache.discard(&batch);
                Ok(self.finish(chunk, outputs.len() as u64, filtered))
            }
            Err(err) => {
                listener.on_write_error(&outputs, &err)?;
                Err(self.on_write_error(&batch, err))
            }
        }
    }

    /// Commit the chunk: everything left in it was written or filtered.
    fn finish(&self, chunk: &mut Chunk<I, O>, written: u64, filtered: u64) -> StepContribution {
        for entry in chunk.entries.drain(..) {
            self.cache.discard(&entry.key);
        }
        let mut contribution = chunk.contribution.take();
        contribution.write_count += written;
        contribution.filter_count += filtered;
        contribution
    }

    fn transform(
        &self,
        entry: &mut Entry<I, O>,
        listener: &CompositeListener<I, O>,
        tally: &SkipTally,
    ) -> Result<Transformed<O>, ChunkError> {
        if !self.processor_transactional {
            if let Some(cached) = &entry.output {
                return Ok(match cached.clone() {
                    Some(output) => Transformed::Output(output),
                    None => Transformed::Filtered,
                });
            }
        }

        if self.cache.is_exhausted(&entry.key) {
            if let Some(context) = self.cache.take(&entry.key) {
                let RetryContext {
                    attempts,
                    retryable,
                    last_error,
                    ..
                } = context;
                let exhausted_retries = retryable.then_some(attempts);
                return self
                    .skip_or_escalate(Phase::Process, &*self.process_skip, last_error, tally, exhausted_retries)
                    .map(Transformed::Skipped);
            }
        }

        listener.before_process(&entry.item)?;
        let err = match self.processor.process(&entry.item) {
            Ok(result) => {
                listener.after_process(&entry.item, result.as_ref())?;
                if !self.processor_transactional {
                    entry.output = Some(result.clone());
                }
                return Ok(match result {
                    Some(output) => Transformed::Output(output),
                    None => Transformed::Filtered,
                });
            }
            Err(err) => err,
        };

        listener.on_process_error(&entry.item, &err)?;
        if is_fatal(&err) {
            return Err(StepError::escalate(Phase::Process, err).into());
        }
        if self.rollback.is_no_rollback(&err) {
            return self
                .skip_or_escalate(Phase::Process, &*self.process_skip, err, tally, None)
                .map(Transformed::Skipped);
        }

        let retryable = self.retry.is_retryable(&err);
        if !retryable && !self.process_skip.is_skippable(&err) {
            return Err(StepError::NonSkippable {
                phase: Phase::Process,
                source: err,
            }
            .into());
        }
        Err(self.register(Phase::Process, &entry.key, err, retryable))
    }

    /// Record a failed attempt, wait out the backoff and ask for a rollback.
    fn register(&self, phase: Phase, key: &ItemKey, err: anyhow::Error, retryable: bool) -> ChunkError {
        let message = format!("{err:#}");
        let state = match self
            .cache
            .register_failure(key, err, retryable, |attempts| self.retry.should_retry(attempts))
        {
            Ok(state) => state,
            Err(config) => return ChunkError::Fatal(config.into()),
        };
        self.backoff(phase, state);
        ChunkError::Rollback { phase, message }
    }

    fn backoff(&self, phase: Phase, state: RetryState) {
        if state.exhausted {
            debug!(%phase, attempts = state.attempts, "no attempts left, recovering on replay");
            return;
        }
        let delay = self.retry.delay_for_attempt(state.attempts);
        debug!(%phase, attempts = state.attempts, ?delay, "retrying after rollback");
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn on_write_error(&self, batch: &ItemKey, err: anyhow::Error) -> ChunkError {
        if is_fatal(&err) {
            return StepError::escalate(Phase::Write, err).into();
        }
        let skippable = self.write_skip.is_skippable(&err);

        if self.rollback.is_no_rollback(&err) {
            if !skippable {
                return StepError::NonSkippable {
                    phase: Phase::Write,
                    source: err,
                }
                .into();
            }
            // Roll back anyway so the scan can find the item.
            let forced = anyhow::Error::new(ForceRollbackForWriteSkip { source: err });
            return self.register(Phase::Write, batch, forced, false);
        }

        let retryable = self.retry.is_retryable(&err);
        if !retryable && !skippable {
            return StepError::NonSkippable {
                phase: Phase::Write,
                source: err,
            }
            .into();
        }
        self.register(Phase::Write, batch, err, retryable)
    }

    /// The batch write has no attempts left.
    fn recover_write(
        &self,
        chunk: &mut Chunk<I, O>,
        outputs: Vec<O>,
        filtered: u64,
        context: RetryContext,
        listener: &CompositeListener<I, O>,
        tally: &SkipTally,
    ) -> Result<StepContribution, ChunkError> {
        let RetryContext {
            attempts,
            retryable,
            last_error,
            ..
        } = context;

        if !self.write_skip.is_skippable(&last_error) {
            let err = if retryable {
                StepError::RetryExhausted {
                    phase: Phase::Write,
                    attempts,
                    source: last_error,
                }
            } else {
                StepError::NonSkippable {
                    phase: Phase::Write,
                    source: last_error,
                }
            };
            return Err(err.into());
        }

        if self.buffering {
            debug!(items = chunk.len(), "scanning chunk to isolate the failed write");
            chunk.scanning = true;
            return self.scan(chunk, listener, tally);
        }

        // Redelivered items cannot be replayed one at a time: skip them all.
        let count = outputs.len() as u64;
        for _ in 0..count {
            if let Err(refusal) = self.claim_skip(Phase::Write, &*self.write_skip, &last_error, tally) {
                return Err(refusal.with_source(last_error));
            }
        }
        warn!(items = count, error = %last_error, "skipping every item of a redelivered chunk");
        chunk.contribution.write_skip_count += count;
        chunk.skips.push(SkipRecord::Write(outputs, last_error));
        Ok(self.finish(chunk, 0, filtered))
    }

    /// Replay the chunk one item per transaction.
    ///
    /// Returns after the first item that needs its own commit or rollback;
    /// the caller keeps calling until the chunk is finished.
    fn scan(
        &self,
        chunk: &mut Chunk<I, O>,
        listener: &CompositeListener<I, O>,
        tally: &SkipTally,
    ) -> Result<StepContribution, ChunkError> {
        while !chunk.entries.is_empty() {
            let output = match self.transform(&mut chunk.entries[0], listener, tally)? {
                Transformed::Output(output) => output,
                Transformed::Filtered => {
                    let entry = chunk.entries.remove(0);
                    self.cache.discard(&entry.key);
                    chunk.contribution.filter_count += 1;
                    return Ok(chunk.contribution.take());
                }
                Transformed::Skipped(err) => {
                    let entry = chunk.entries.remove(0);
                    chunk.contribution.process_skip_count += 1;
                    chunk.skips.push(SkipRecord::Process(entry.item, err));
                    continue;
                }
            };

            let items = std::slice::from_ref(&output);
            listener.before_write(items)?;
            let err = match self.writer.write(items) {
                Ok(()) => {
                    listener.after_write(items)?;
                    let entry = chunk.entries.remove(0);
                    self.cache.discard(&entry.key);
                    chunk.contribution.write_count += 1;
                    return Ok(chunk.contribution.take());
                }
                Err(err) => err,
            };

            listener.on_write_error(items, &err)?;
            if is_fatal(&err) {
                return Err(StepError::escalate(Phase::Write, err).into());
            }
            let err = self.skip_or_escalate(Phase::Write, &*self.write_skip, err, tally, None)?;
            let entry = chunk.entries.remove(0);
            self.cache.discard(&entry.key);
            chunk.contribution.write_skip_count += 1;
            let rollback = self.rollback.should_rollback(&err);
            let message = format!("{err:#}");
            chunk.skips.push(SkipRecord::Write(vec![output], err));
            if rollback {
                return Err(ChunkError::Rollback {
                    phase: Phase::Write,
                    message,
                });
            }
            return Ok(chunk.contribution.take());
        }
        Ok(chunk.contribution.take())
    }

    /// Skip `err` if the policy allows it, otherwise turn it into the step
    /// failure that names why not.
    fn skip_or_escalate(
        &self,
        phase: Phase,
        policy: &dyn SkipPolicy,
        err: anyhow::Error,
        tally: &SkipTally,
        exhausted_retries: Option<u32>,
    ) -> Result<anyhow::Error, ChunkError> {
        match self.claim_skip(phase, policy, &err, tally) {
            Ok(()) => {
                debug!(%phase, error = %err, "skipping item");
                Ok(err)
            }
            Err(Refusal::NotSkippable) => Err(match exhausted_retries {
                Some(attempts) => StepError::RetryExhausted {
                    phase,
                    attempts,
                    source: err,
                },
                None => StepError::NonSkippable { phase, source: err },
            }
            .into()),
            Err(Refusal::LimitExceeded(limit)) => Err(StepError::SkipLimitExceeded {
                phase,
                limit,
                source: err,
            }
            .into()),
        }
    }

    fn claim_skip(
        &self,
        phase: Phase,
        policy: &dyn SkipPolicy,
        err: &anyhow::Error,
        tally: &SkipTally,
    ) -> Result<(), Refusal> {
        match tally.try_skip(phase, |count| policy.should_skip(err, count)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Refusal::NotSkippable),
            Err(exceeded) => Err(Refusal::LimitExceeded(exceeded.limit)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Refusal {
    NotSkippable,
    LimitExceeded(u64),
}

impl Refusal {
    fn with_source(self, source: anyhow::Error) -> ChunkError {
        let err = match self {
            Refusal::NotSkippable => StepError::NonSkippable {
                phase: Phase::Write,
                source,
            },
            Refusal::LimitExceeded(limit) => StepError::SkipLimitExceeded {
                phase: Phase::Write,
                limit,
                source,
            },
        };
        ChunkError::Fatal(err)
    }
}
