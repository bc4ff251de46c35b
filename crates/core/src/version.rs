//! Optimistic concurrency expectations for persisted execution records.

use crate::error::{DomainError, DomainResult};

/// A record whose persisted state is guarded by a version counter.
///
/// `None` means the record was never saved. Every successful persisted update
/// advances the version by exactly one.
pub trait Versioned {
    fn version(&self) -> Option<u64>;
}

/// Optimistic concurrency expectation for an update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (used for wholesale context replacement).
    Any,
    /// Require the stored record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// The expectation carried by an in-memory copy of a saved record.
    pub fn of(record: &impl Versioned) -> DomainResult<Self> {
        record
            .version()
            .map(ExpectedVersion::Exact)
            .ok_or_else(|| DomainError::invariant("record has not been saved (no version)"))
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
