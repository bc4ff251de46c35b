//! Step configuration.
//!
//! [`StepSettings`] is plain data that can be loaded from JSON; [`StepConfig`]
//! is the validated, immutable form the step is built from. Every invalid
//! combination is rejected when the config is constructed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::completion::{CompletionPolicy, SimpleCompletionPolicy};
use crate::error::{ConfigError, Phase};
use crate::policy::{FaultRules, LimitCheckingSkipPolicy, RetryPolicy, RollbackClassifier, SkipPolicy};
use crate::restart::RestartRules;
use crate::retry_cache::DEFAULT_CAPACITY;

/// Read-skip cap per chunk when a custom completion policy hides the chunk
/// size.
pub const DEFAULT_MAX_SKIPS_ON_READ: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    /// Items per chunk. Exactly one of this and a custom completion policy
    /// must be given.
    pub chunk_size: Option<usize>,
    pub fault_tolerant: bool,
    /// Skip limit shared by every phase without its own limit.
    pub skip_limit: u64,
    pub read_skip_limit: Option<u64>,
    pub process_skip_limit: Option<u64>,
    pub write_skip_limit: Option<u64>,
    pub retry: RetryPolicy,
    /// Read skips after which a chunk is closed early. Defaults to the chunk
    /// size.
    pub max_skips_on_read: Option<usize>,
    /// Re-run the processor on every replay instead of reusing its outputs.
    pub processor_transactional: bool,
    /// Worker threads, each running whole chunks.
    pub throttle_limit: usize,
    pub allow_start_if_complete: bool,
    pub start_limit: Option<usize>,
    pub retry_cache_capacity: usize,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            chunk_size: None,
            fault_tolerant: false,
            skip_limit: 10,
            read_skip_limit: None,
            process_skip_limit: None,
            write_skip_limit: None,
            retry: RetryPolicy::default(),
            max_skips_on_read: None,
            processor_transactional: true,
            throttle_limit: 1,
            allow_start_if_complete: false,
            start_limit: None,
            retry_cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl StepSettings {
    pub fn chunked(chunk_size: usize) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    pub fn fault_tolerant(mut self) -> Self {
        self.fault_tolerant = true;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::invalid(format!("step settings: {e}")))
    }

    fn skip_limit_for(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Read => self.read_skip_limit,
            Phase::Process => self.process_skip_limit,
            Phase::Write => self.write_skip_limit,
        }
        .unwrap_or(self.skip_limit)
    }
}

#[derive(Debug, Clone)]
pub struct StepConfig {
    settings: StepSettings,
    rules: FaultRules,
    completion: Arc<dyn CompletionPolicy>,
    max_skips_on_read: usize,
    skip_policy: Option<Arc<dyn SkipPolicy>>,
}

impl StepConfig {
    pub fn new(settings: StepSettings, rules: FaultRules) -> Result<Self, ConfigError> {
        Self::build(settings, rules, None)
    }

    /// Close chunks with `completion` instead of a fixed chunk size.
    pub fn with_completion_policy(
        settings: StepSettings,
        rules: FaultRules,
        completion: Arc<dyn CompletionPolicy>,
    ) -> Result<Self, ConfigError> {
        Self::build(settings, rules, Some(completion))
    }

    fn build(
        settings: StepSettings,
        rules: FaultRules,
        custom: Option<Arc<dyn CompletionPolicy>>,
    ) -> Result<Self, ConfigError> {
        let (completion, default_max_skips): (Arc<dyn CompletionPolicy>, usize) =
            match (settings.chunk_size, custom) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::invalid(
                        "chunk_size and a custom completion policy are mutually exclusive",
                    ));
                }
                (None, None) => {
                    return Err(ConfigError::invalid(
                        "either chunk_size or a completion policy is required",
                    ));
                }
                (Some(0), None) => return Err(ConfigError::invalid("chunk_size must be positive")),
                (Some(size), None) => (Arc::new(SimpleCompletionPolicy::new(size)), size),
                (None, Some(policy)) => (policy, DEFAULT_MAX_SKIPS_ON_READ),
            };

        let max_skips_on_read = settings.max_skips_on_read.unwrap_or(default_max_skips);
        if max_skips_on_read == 0 {
            return Err(ConfigError::invalid("max_skips_on_read must be positive"));
        }
        if let Some(size) = settings.chunk_size {
            if max_skips_on_read < size {
                return Err(ConfigError::invalid(format!(
                    "max_skips_on_read ({max_skips_on_read}) must not be below chunk_size ({size})"
                )));
            }
        }
        if settings.throttle_limit == 0 {
            return Err(ConfigError::invalid("throttle_limit must be positive"));
        }
        if settings.retry_cache_capacity == 0 {
            return Err(ConfigError::invalid("retry_cache_capacity must be positive"));
        }
        if settings.start_limit == Some(0) {
            return Err(ConfigError::invalid("start_limit must be positive"));
        }

        Ok(Self {
            settings,
            rules,
            completion,
            max_skips_on_read,
            skip_policy: None,
        })
    }

    /// Use `policy` for every phase instead of limit-checking policies built
    /// from the rules.
    pub fn with_skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.skip_policy = Some(policy);
        self
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    pub fn rules(&self) -> &FaultRules {
        &self.rules
    }

    pub fn completion(&self) -> Arc<dyn CompletionPolicy> {
        Arc::clone(&self.completion)
    }

    pub fn max_skips_on_read(&self) -> usize {
        self.max_skips_on_read
    }

    pub fn throttle_limit(&self) -> usize {
        self.settings.throttle_limit
    }

    pub fn skip_policy(&self, phase: Phase) -> Arc<dyn SkipPolicy> {
        match &self.skip_policy {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(LimitCheckingSkipPolicy::new(
                self.settings.skip_limit_for(phase),
                self.rules.skippable().clone(),
            )),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings
            .retry
            .clone()
            .with_retryable(self.rules.retryable().clone())
    }

    pub fn rollback_classifier(&self) -> RollbackClassifier {
        RollbackClassifier::new(self.rules.no_rollback_rules().clone())
    }

    pub fn restart_rules(&self) -> RestartRules {
        RestartRules {
            allow_start_if_complete: self.settings.allow_start_if_complete,
            start_limit: self.settings.start_limit,
        }
    }
}
