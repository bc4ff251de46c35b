//! Completion policies decide when a chunk is full.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Progress of the chunk being read.
#[derive(Debug, Clone, Copy)]
pub struct ChunkState {
    pub started: Instant,
    pub count: usize,
}

impl ChunkState {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }
}

pub trait CompletionPolicy: Send + Sync + fmt::Debug {
    fn is_complete(&self, state: &ChunkState) -> bool;
}

/// Complete after a fixed number of items.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl SimpleCompletionPolicy {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, state: &ChunkState) -> bool {
        state.count >= self.chunk_size
    }
}

/// Complete once the chunk has been open for `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutCompletionPolicy {
    timeout: Duration,
}

impl TimeoutCompletionPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutCompletionPolicy {
    fn is_complete(&self, state: &ChunkState) -> bool {
        state.count > 0 && state.started.elapsed() >= self.timeout
    }
}

/// Complete as soon as any member is.
#[derive(Debug, Clone, Default)]
pub struct CompositeCompletionPolicy {
    policies: Vec<Arc<dyn CompletionPolicy>>,
}

impl CompositeCompletionPolicy {
    pub fn new(policies: Vec<Arc<dyn CompletionPolicy>>) -> Self {
        Self { policies }
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn is_complete(&self, state: &ChunkState) -> bool {
        self.policies.iter().any(|p| p.is_complete(state))
    }
}
