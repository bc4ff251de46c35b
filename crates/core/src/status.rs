//! Batch and exit statuses.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Longest exit description kept on an execution record.
pub const MAX_EXIT_DESCRIPTION_LEN: usize = 2500;

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in severity order, so the derived `Ord` is the
/// partial order used by [`BatchStatus::upgrade_to`]:
/// `COMPLETED < STARTING < STARTED < STOPPING < STOPPED < FAILED < ABANDONED < UNKNOWN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }

    pub fn is_unsuccessful(self) -> bool {
        self >= Self::Failed
    }

    /// Combine two statuses without ever regressing.
    ///
    /// Once either side is past `STARTED` the more severe one wins. Before that a
    /// `COMPLETED` on either side wins, otherwise the later lifecycle state.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self > Self::Started || other > Self::Started {
            self.max(other)
        } else if self == Self::Completed || other == Self::Completed {
            Self::Completed
        } else {
            self.max(other)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Abandoned => "ABANDONED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "COMPLETED" => Self::Completed,
            "STARTING" => Self::Starting,
            "STARTED" => Self::Started,
            "STOPPING" => Self::Stopping,
            "STOPPED" => Self::Stopped,
            "FAILED" => Self::Failed,
            "ABANDONED" => Self::Abandoned,
            "UNKNOWN" => Self::Unknown,
            other => {
                return Err(DomainError::validation(format!(
                    "unknown batch status '{other}'"
                )));
            }
        })
    }
}

/// Exit code and description reported by a finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    code: String,
    description: String,
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn severity(&self) -> u8 {
        match self.code.as_str() {
            Self::EXECUTING => 1,
            Self::COMPLETED => 2,
            Self::NOOP => 3,
            Self::STOPPED => 4,
            Self::FAILED => 5,
            Self::UNKNOWN => 6,
            _ => 7,
        }
    }

    /// Append a description, separated from any existing one by `"; "`.
    pub fn with_description(mut self, description: impl AsRef<str>) -> Self {
        let description = description.as_ref();
        if !description.is_empty() && self.description != description {
            if !self.description.is_empty() {
                self.description.push_str("; ");
            }
            self.description.push_str(description);
        }
        self.description = truncate(&self.description, MAX_EXIT_DESCRIPTION_LEN);
        self
    }

    /// Describe an error by its full cause chain, truncated.
    pub fn with_error(self, error: &(dyn std::error::Error + 'static)) -> Self {
        self.with_description(describe_error(error))
    }

    /// Combine two exit statuses: the more severe code wins and the descriptions
    /// are concatenated.
    pub fn and(self, other: ExitStatus) -> ExitStatus {
        let replace = other.severity() > self.severity()
            || (other.severity() == self.severity() && other.code > self.code);
        let code = if replace {
            other.code.clone()
        } else {
            self.code.clone()
        };
        let combined = self.with_description(&other.description);
        ExitStatus {
            code,
            description: combined.description,
        }
    }

    pub fn is_running(&self) -> bool {
        self.code == Self::EXECUTING || self.code == Self::UNKNOWN
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{} ({})", self.code, self.description)
        }
    }
}

/// An error and every cause beneath it, joined with `": "`.
pub fn describe_error(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
