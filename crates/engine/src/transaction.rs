//! Transaction boundary around one chunk.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait Transaction: Send {
    fn commit(self: Box<Self>) -> anyhow::Result<()>;
    fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> anyhow::Result<Box<dyn Transaction>>;
}

impl<T> TransactionManager for Arc<T>
where
    T: TransactionManager + ?Sized,
{
    fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        (**self).begin()
    }
}

#[derive(Debug, Default)]
struct Outcomes {
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// For collaborators with no transactional resource. Only counts outcomes.
#[derive(Debug, Clone, Default)]
pub struct ResourcelessTransactionManager {
    outcomes: Arc<Outcomes>,
}

impl ResourcelessTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> u64 {
        self.outcomes.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.outcomes.rollbacks.load(Ordering::Relaxed)
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        Ok(Box::new(ResourcelessTransaction {
            outcomes: Arc::clone(&self.outcomes),
        }))
    }
}

struct ResourcelessTransaction {
    outcomes: Arc<Outcomes>,
}

impl Transaction for ResourcelessTransaction {
    fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.outcomes.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.outcomes.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
