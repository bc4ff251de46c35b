//! Fault policies: skip, retry and rollback classification.
//!
//! [`FaultRules`] collects the user's rules in one place; the step
//! configuration turns them into per-phase [`SkipPolicy`] values, a
//! [`RetryPolicy`] and a [`RollbackClassifier`].

pub mod classifier;
pub mod retry;
pub mod rollback;
pub mod skip;

pub use classifier::Classifier;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use rollback::RollbackClassifier;
pub use skip::{AlwaysSkip, LimitCheckingSkipPolicy, NeverSkip, SkipPolicy};

use crate::error::is_fatal;

/// What the engine does with an item error, all rules considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    Skip,
    Retry,
    NoRollback,
    Fatal,
}

/// User-supplied error classification rules.
#[derive(Debug, Clone, Default)]
pub struct FaultRules {
    skippable: Classifier<bool>,
    retryable: Classifier<bool>,
    no_rollback: Classifier<bool>,
}

impl FaultRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.skippable = self.skippable.on::<E>(true);
        self
    }

    /// Never skip `E`, even when a later rule would.
    pub fn no_skip<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.skippable = self.skippable.on::<E>(false);
        self
    }

    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.skippable = self.skippable.rule(predicate, true);
        self
    }

    pub fn retry<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.retryable = self.retryable.on::<E>(true);
        self
    }

    pub fn no_retry<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.retryable = self.retryable.on::<E>(false);
        self
    }

    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = self.retryable.rule(predicate, true);
        self
    }

    pub fn no_rollback<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.no_rollback = self.no_rollback.on::<E>(true);
        self
    }

    pub fn skippable(&self) -> &Classifier<bool> {
        &self.skippable
    }

    pub fn retryable(&self) -> &Classifier<bool> {
        &self.retryable
    }

    pub fn no_rollback_rules(&self) -> &Classifier<bool> {
        &self.no_rollback
    }

    /// Summarise the rules for one error.
    ///
    /// Fatal errors win, then retry, then skip, then no-rollback; an error
    /// matching none of them is fatal. The step itself consults the per-phase
    /// skip, retry and rollback policies built from these rules, which may be
    /// replaced; this is the view of the rules alone, for callers inspecting
    /// a configuration.
    pub fn classify(&self, err: &anyhow::Error) -> FaultDecision {
        if is_fatal(err) {
            FaultDecision::Fatal
        } else if self.retryable.classify(err) {
            FaultDecision::Retry
        } else if self.skippable.classify(err) {
            FaultDecision::Skip
        } else if self.no_rollback.classify(err) {
            FaultDecision::NoRollback
        } else {
            FaultDecision::Fatal
        }
    }
}

#[cfg(test)]
mod tests {
    use thiserror::Error;

    use crate::error::{SkipLimitExceeded, Unrecoverable};

    use super::*;

    #[derive(Debug, Error)]
    #[error("transient")]
    struct Transient;

    #[derive(Debug, Error)]
    #[error("bad input")]
    struct BadInput;

    #[derive(Debug, Error)]
    #[error("duplicate key")]
    struct Duplicate;

    fn rules() -> FaultRules {
        FaultRules::new()
            .retry::<Transient>()
            .skip::<BadInput>()
            .no_rollback::<Duplicate>()
    }

    #[test]
    fn classify_orders_decisions() {
        let rules = rules();
        assert_eq!(rules.classify(&anyhow::Error::new(Transient)), FaultDecision::Retry);
        assert_eq!(rules.classify(&anyhow::Error::new(BadInput)), FaultDecision::Skip);
        assert_eq!(rules.classify(&anyhow::Error::new(Duplicate)), FaultDecision::NoRollback);
        assert_eq!(rules.classify(&anyhow::anyhow!("boom")), FaultDecision::Fatal);
    }

    #[test]
    fn fatal_wins_even_when_user_asks_to_skip_it() {
        let rules = FaultRules::new()
            .skip::<Unrecoverable>()
            .retry::<SkipLimitExceeded>()
            .skip_when(|_| true);
        assert_eq!(
            rules.classify(&anyhow::Error::new(Unrecoverable::new("broken invariant"))),
            FaultDecision::Fatal
        );
        assert_eq!(
            rules.classify(&anyhow::Error::new(SkipLimitExceeded { limit: 1 })),
            FaultDecision::Fatal
        );
    }

    #[test]
    fn no_skip_shadows_later_rules() {
        let rules = FaultRules::new().no_skip::<BadInput>().skip_when(|_| true);
        assert_eq!(rules.classify(&anyhow::Error::new(BadInput)), FaultDecision::Fatal);
        assert_eq!(rules.classify(&anyhow::anyhow!("other")), FaultDecision::Skip);
    }
}
