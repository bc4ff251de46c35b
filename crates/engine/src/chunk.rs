//! The in-flight chunk.
//!
//! A chunk lives from the read that opens it to the commit that finishes it.
//! When a transaction rolls back, a buffered chunk is kept and replayed; its
//! skip decisions and read counts are permanent and travel with it until the
//! next commit.

use std::sync::atomic::{AtomicU64, Ordering};

use batchforge_core::{StepContribution, StepCounters};

use crate::error::{Phase, StepError};
use crate::listener::CompositeListener;
use crate::retry_cache::ItemKey;

/// One item of the chunk.
#[derive(Debug)]
pub struct Entry<I, O> {
    pub item: I,
    pub key: ItemKey,
    /// Index of the reader call that produced the item, within the chunk.
    pub position: u64,
    /// Processor result kept from an earlier attempt.
    pub(crate) output: Option<Option<O>>,
}

/// A skip decided while handling the chunk, announced to listeners once the
/// chunk commits.
#[derive(Debug)]
pub enum SkipRecord<I, O> {
    Read(anyhow::Error),
    Process(I, anyhow::Error),
    /// Items skipped by one write failure.
    Write(Vec<O>, anyhow::Error),
}

#[derive(Debug)]
pub struct Chunk<I, O> {
    pub(crate) entries: Vec<Entry<I, O>>,
    /// Counters that survive rollbacks until the next commit.
    pub(crate) contribution: StepContribution,
    pub(crate) skips: Vec<SkipRecord<I, O>>,
    /// Reader calls made for this chunk.
    pub(crate) reads: u64,
    pub(crate) scanning: bool,
    pub(crate) end_of_input: bool,
}

impl<I, O> Default for Chunk<I, O> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            contribution: StepContribution::default(),
            skips: Vec::new(),
            reads: 0,
            scanning: false,
            end_of_input: false,
        }
    }
}

impl<I, O> Chunk<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &I> {
        self.entries.iter().map(|e| &e.item)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_end_of_input(&self) -> bool {
        self.end_of_input
    }

    /// Nothing was read and nothing is pending: the trailing read at the end
    /// of the input.
    pub(crate) fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.skips.is_empty() && self.contribution.is_empty()
    }

    /// All items have been written, filtered or skipped.
    pub(crate) fn is_finished(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reader calls already accounted for by commits, used as restart offset
    /// while the chunk is being scanned.
    pub(crate) fn committed_offset(&self) -> u64 {
        self.entries.first().map_or(self.reads, |e| e.position)
    }

    pub(crate) fn notify_skips(&mut self, listener: &CompositeListener<I, O>) -> Result<(), StepError> {
        for skip in self.skips.drain(..) {
            match &skip {
                SkipRecord::Read(err) => listener.on_skip_in_read(err)?,
                SkipRecord::Process(item, err) => listener.on_skip_in_process(item, err)?,
                SkipRecord::Write(items, err) => {
                    for item in items {
                        listener.on_skip_in_write(item, err)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Skip counts per phase across the whole step execution.
///
/// Skip decisions are never undone, so the tally is exact even while
/// transactions roll back; concurrent workers share one tally.
#[derive(Debug, Default)]
pub struct SkipTally {
    read: AtomicU64,
    process: AtomicU64,
    write: AtomicU64,
}

impl SkipTally {
    pub fn from_counters(counters: &StepCounters) -> Self {
        Self {
            read: AtomicU64::new(counters.read_skip_count),
            process: AtomicU64::new(counters.process_skip_count),
            write: AtomicU64::new(counters.write_skip_count),
        }
    }

    fn counter(&self, phase: Phase) -> &AtomicU64 {
        match phase {
            Phase::Read => &self.read,
            Phase::Process => &self.process,
            Phase::Write => &self.write,
        }
    }

    pub fn get(&self, phase: Phase) -> u64 {
        self.counter(phase).load(Ordering::SeqCst)
    }

    /// Count one more skip if `decide` allows it at the current count.
    ///
    /// The count is claimed with compare-and-swap so that concurrent workers
    /// never overshoot the limit between deciding and counting.
    pub fn try_skip<E>(
        &self,
        phase: Phase,
        mut decide: impl FnMut(u64) -> Result<bool, E>,
    ) -> Result<bool, E> {
        let counter = self.counter(phase);
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if !decide(current)? {
                return Ok(false);
            }
            match counter.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_points_at_first_pending_entry() {
        let mut chunk: Chunk<u32, u32> = Chunk::new();
        chunk.reads = 4;
        assert_eq!(chunk.committed_offset(), 4);
        chunk.entries.push(Entry {
            item: 7,
            key: ItemKey::of(&7),
            position: 2,
            output: None,
        });
        assert_eq!(chunk.committed_offset(), 2);
    }

    #[test]
    fn tally_starts_from_persisted_counters() {
        let counters = StepCounters {
            process_skip_count: 3,
            ..Default::default()
        };
        let tally = SkipTally::from_counters(&counters);
        assert_eq!(tally.try_skip(Phase::Process, |count| Ok::<_, ()>(count < 5)), Ok(true));
        assert_eq!(tally.get(Phase::Process), 4);
        assert_eq!(tally.get(Phase::Write), 0);
    }

    #[test]
    fn try_skip_only_counts_allowed_skips() {
        let tally = SkipTally::default();
        let limit = 2;
        let decide = |count: u64| -> Result<bool, u64> {
            if count < limit { Ok(true) } else { Err(count) }
        };
        assert_eq!(tally.try_skip(Phase::Write, decide), Ok(true));
        assert_eq!(tally.try_skip(Phase::Write, decide), Ok(true));
        assert_eq!(tally.try_skip(Phase::Write, decide), Err(2));
        assert_eq!(tally.try_skip(Phase::Write, |_| Ok::<_, u64>(false)), Ok(false));
        assert_eq!(tally.get(Phase::Write), 2);
    }
}
