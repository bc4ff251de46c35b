//! Reader checkpoints at chunk boundaries.
//!
//! A committed chunk normally moves the reader checkpoint to the end of the
//! chunk. While a chunk is scanned, commits happen in the middle of it: the
//! checkpoint then stays at the reader state from before the chunk, plus an
//! offset of reader calls to replay and discard on restart.

use batchforge_core::ExecutionContext;
use tracing::debug;

use crate::chunk::Chunk;
use crate::error::StepError;
use crate::item::ItemReader;

/// Context key holding the number of reader calls to discard after `open`.
pub const OFFSET_KEY: &str = "chunk_monitor.offset";

fn stream_error(operation: &'static str) -> impl FnOnce(anyhow::Error) -> StepError {
    move |source| StepError::Stream { operation, source }
}

#[derive(Debug, Default)]
pub struct ChunkMonitor {
    /// Reader state at the start of the current chunk.
    snapshot: ExecutionContext,
}

impl ChunkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the reader from `context` and fast-forward past items that a
    /// scanned chunk already committed.
    pub fn open<I>(&mut self, reader: &mut dyn ItemReader<I>, context: &ExecutionContext) -> Result<(), StepError> {
        reader.open(context).map_err(stream_error("open"))?;
        let offset = context.get_i64(OFFSET_KEY).unwrap_or(0);
        if offset > 0 {
            debug!(offset, "skipping reader calls committed before restart");
        }
        for _ in 0..offset {
            // Failed reads were accounted for before the restart too.
            if let Ok(None) = reader.read() {
                break;
            }
        }
        self.snapshot = ExecutionContext::new();
        reader.update(&mut self.snapshot).map_err(stream_error("update"))?;
        Ok(())
    }

    /// Remember the reader state before a new chunk is read.
    pub fn mark<I>(&mut self, reader: &mut dyn ItemReader<I>) -> Result<(), StepError> {
        let mut snapshot = ExecutionContext::new();
        reader.update(&mut snapshot).map_err(stream_error("update"))?;
        self.snapshot = snapshot;
        Ok(())
    }

    /// Write the checkpoint for a committed attempt at `chunk`.
    pub fn checkpoint<I, O>(
        &self,
        reader: &mut dyn ItemReader<I>,
        chunk: &Chunk<I, O>,
        context: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        if chunk.is_finished() {
            reader.update(context).map_err(stream_error("update"))?;
            context.remove(OFFSET_KEY);
        } else {
            context.merge(&self.snapshot);
            context.put_i64(OFFSET_KEY, chunk.committed_offset() as i64);
        }
        Ok(())
    }
}
