//! Bounded read with skip-on-read.

use std::sync::Arc;

use tracing::debug;

use crate::chunk::{Chunk, Entry, SkipRecord, SkipTally};
use crate::completion::{ChunkState, CompletionPolicy};
use crate::error::{Phase, StepError, is_fatal};
use crate::item::ItemReader;
use crate::listener::CompositeListener;
use crate::policy::SkipPolicy;
use crate::retry_cache::KeyGenerator;

/// Pulls items from a reader into a chunk until the completion policy says
/// the chunk is full or the reader is exhausted.
pub struct ChunkProvider<I> {
    completion: Arc<dyn CompletionPolicy>,
    skip_policy: Arc<dyn SkipPolicy>,
    fault_tolerant: bool,
    max_skips_on_read: usize,
    keys: KeyGenerator<I>,
}

impl<I> ChunkProvider<I> {
    pub fn new(
        completion: Arc<dyn CompletionPolicy>,
        skip_policy: Arc<dyn SkipPolicy>,
        fault_tolerant: bool,
        max_skips_on_read: usize,
        keys: KeyGenerator<I>,
    ) -> Self {
        Self {
            completion,
            skip_policy,
            fault_tolerant,
            max_skips_on_read,
            keys,
        }
    }

    pub fn provide<O>(
        &self,
        reader: &mut dyn ItemReader<I>,
        listener: &CompositeListener<I, O>,
        tally: &SkipTally,
    ) -> Result<Chunk<I, O>, StepError> {
        let mut chunk = Chunk::new();
        let mut state = ChunkState::start();
        let mut skipped_here = 0usize;

        while !self.completion.is_complete(&state) {
            listener.before_read()?;
            let position = chunk.reads;
            chunk.reads += 1;

            match reader.read() {
                Ok(Some(item)) => {
                    listener.after_read(&item)?;
                    let key = (self.keys)(&item);
                    chunk.entries.push(Entry {
                        item,
                        key,
                        position,
                        output: None,
                    });
                    chunk.contribution.read_count += 1;
                    state.count += 1;
                }
                Ok(None) => {
                    chunk.end_of_input = true;
                    break;
                }
                Err(err) => {
                    listener.on_read_error(&err)?;
                    self.on_read_error(&mut chunk, err, tally)?;
                    skipped_here += 1;
                    if skipped_here >= self.max_skips_on_read {
                        debug!(skipped_here, "read skip bound reached, closing chunk early");
                        break;
                    }
                }
            }
        }

        Ok(chunk)
    }

    fn on_read_error<O>(
        &self,
        chunk: &mut Chunk<I, O>,
        err: anyhow::Error,
        tally: &SkipTally,
    ) -> Result<(), StepError> {
        if !self.fault_tolerant || is_fatal(&err) {
            return Err(StepError::escalate(Phase::Read, err));
        }
        match tally.try_skip(Phase::Read, |count| self.skip_policy.should_skip(&err, count)) {
            Ok(true) => {
                debug!(error = %err, "skipping item that failed to read");
                chunk.contribution.read_skip_count += 1;
                chunk.skips.push(SkipRecord::Read(err));
                Ok(())
            }
            Ok(false) => Err(StepError::NonSkippable {
                phase: Phase::Read,
                source: err,
            }),
            Err(exceeded) => Err(StepError::SkipLimitExceeded {
                phase: Phase::Read,
                limit: exceeded.limit,
                source: err,
            }),
        }
    }
}
