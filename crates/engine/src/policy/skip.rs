//! Skip policies.
//!
//! A skip policy is consulted with the error and the cumulative number of
//! items already skipped in the same phase. Always-fatal errors are never
//! skipped, whatever the policy says.

use std::fmt;

use crate::error::{SkipLimitExceeded, is_fatal};

use super::classifier::Classifier;

pub trait SkipPolicy: Send + Sync + fmt::Debug {
    /// Whether the error is eligible for skipping at all.
    fn is_skippable(&self, err: &anyhow::Error) -> bool;

    /// Decide for one failure, given how many items were skipped so far.
    ///
    /// Returns `Err` when the error is eligible but the budget is spent.
    fn should_skip(&self, err: &anyhow::Error, skip_count: u64) -> Result<bool, SkipLimitExceeded>;
}

/// Skips classified errors until `limit` items have been skipped.
#[derive(Debug, Clone)]
pub struct LimitCheckingSkipPolicy {
    limit: u64,
    skippable: Classifier<bool>,
}

impl LimitCheckingSkipPolicy {
    pub fn new(limit: u64, skippable: Classifier<bool>) -> Self {
        Self { limit, skippable }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn is_skippable(&self, err: &anyhow::Error) -> bool {
        !is_fatal(err) && self.skippable.classify(err)
    }

    fn should_skip(&self, err: &anyhow::Error, skip_count: u64) -> Result<bool, SkipLimitExceeded> {
        if !self.is_skippable(err) {
            return Ok(false);
        }
        if skip_count < self.limit {
            Ok(true)
        } else {
            Err(SkipLimitExceeded { limit: self.limit })
        }
    }
}

/// Skips every non-fatal error, without limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSkip;

impl SkipPolicy for AlwaysSkip {
    fn is_skippable(&self, err: &anyhow::Error) -> bool {
        !is_fatal(err)
    }

    fn should_skip(&self, err: &anyhow::Error, _skip_count: u64) -> Result<bool, SkipLimitExceeded> {
        Ok(self.is_skippable(err))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkip;

impl SkipPolicy for NeverSkip {
    fn is_skippable(&self, _err: &anyhow::Error) -> bool {
        false
    }

    fn should_skip(&self, _err: &anyhow::Error, _skip_count: u64) -> Result<bool, SkipLimitExceeded> {
        Ok(false)
    }
}
