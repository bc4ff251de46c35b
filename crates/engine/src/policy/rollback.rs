//! Whether an escaping error rolls back the chunk transaction.

use crate::error::{ForceRollbackForWriteSkip, StepError};

use super::classifier::Classifier;

/// Rolls back on everything except errors registered as no-rollback.
///
/// Forced-rollback-for-write-skip and retry exhaustion always roll back, so
/// that the item-by-item replay starts from a clean state.
#[derive(Debug, Clone, Default)]
pub struct RollbackClassifier {
    no_rollback: Classifier<bool>,
}

impl RollbackClassifier {
    pub fn new(no_rollback: Classifier<bool>) -> Self {
        Self { no_rollback }
    }

    pub fn should_rollback(&self, err: &anyhow::Error) -> bool {
        let forced = err.chain().any(|cause| {
            cause.is::<ForceRollbackForWriteSkip>()
                || matches!(
                    cause.downcast_ref::<StepError>(),
                    Some(StepError::RetryExhausted { .. })
                )
        });
        forced || !self.no_rollback.classify(err)
    }

    pub fn is_no_rollback(&self, err: &anyhow::Error) -> bool {
        !self.should_rollback(err)
    }
}
