//! Ordered (predicate, decision) rules over item errors.

use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Maps an error to a decision: the first matching rule wins, otherwise the
/// default applies.
pub struct Classifier<D> {
    rules: Vec<(Predicate, D)>,
    default: D,
}

impl<D: Clone> Classifier<D> {
    pub fn new(default: D) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    /// Append a rule matching any error for which `predicate` holds.
    pub fn rule<F>(mut self, predicate: F, decision: D) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.rules.push((Arc::new(predicate), decision));
        self
    }

    /// Append a rule matching errors with an `E` anywhere in their chain.
    pub fn on<E>(self, decision: D) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.rule(|err| err.chain().any(|cause| cause.is::<E>()), decision)
    }

    pub fn classify(&self, err: &anyhow::Error) -> D {
        self.rules
            .iter()
            .find(|(predicate, _)| predicate(err))
            .map(|(_, decision)| decision.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<D: Clone> Clone for Classifier<D> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            default: self.default.clone(),
        }
    }
}

impl<D: Clone + Default> Default for Classifier<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}

impl<D: fmt::Debug> fmt::Debug for Classifier<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("rules", &self.rules.len())
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    #[error("timeout")]
    struct Timeout;

    #[derive(Debug, Error)]
    #[error("parse")]
    struct Parse;

    #[test]
    fn first_matching_rule_wins() {
        let classifier = Classifier::new("fatal")
            .on::<Timeout>("retry")
            .rule(|e| e.to_string().contains("time"), "skip")
            .on::<Parse>("skip");

        assert_eq!(classifier.classify(&anyhow::Error::new(Timeout)), "retry");
        assert_eq!(classifier.classify(&anyhow::anyhow!("overtime")), "skip");
        assert_eq!(classifier.classify(&anyhow::Error::new(Parse)), "skip");
        assert_eq!(classifier.classify(&anyhow::anyhow!("other")), "fatal");
    }

    #[test]
    fn matches_wrapped_causes() {
        let classifier = Classifier::new(false).on::<Parse>(true);
        let err = anyhow::Error::new(Parse).context("line 12");
        assert!(classifier.classify(&err));
    }
}
