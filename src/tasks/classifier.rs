//! Ordered error classification
//!
//! Precedence, first match wins:
//! 1. operator-configured pattern on the error text: terminal
//! 2. safe-to-drop errors: the task's target is gone or already reached
//! 3. expected retryable errors
//! 4. everything else is unexpected: terminal when explicitly marked,
//!    data loss, internal (if configured) or past the attempt ceiling;
//!    otherwise retried

use regex::RegexSet;

use super::errors::{ResourceExhaustedCause, TaskError};
use crate::config::TaskConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    StaleReference,
    NotFound,
    NamespaceDeleted,
    Discarded,
    VersionMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    ResourceExhausted(ResourceExhaustedCause),
    NamespaceNotActive,
    DependencyNotCompleted,
    StandbyRetry,
    NamespaceHandover,
    ShardOwnershipLost,
    DlqWrite,
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    PatternMatched,
    NonRetryable,
    DataLoss,
    InternalError,
    UnexpectedAttemptsExceeded,
}

impl TerminalCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalCause::PatternMatched => "pattern_matched",
            TerminalCause::NonRetryable => "non_retryable",
            TerminalCause::DataLoss => "data_loss",
            TerminalCause::InternalError => "internal_error",
            TerminalCause::UnexpectedAttemptsExceeded => "unexpected_attempts_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    SafeDrop(DropReason),
    Retryable(RetryKind),
    Terminal(TerminalCause),
}

impl Classification {
    /// Whether this outcome adds to the unexpected-error attempt count.
    pub fn counts_as_unexpected(&self) -> bool {
        match self {
            Classification::Retryable(RetryKind::Unexpected) => true,
            Classification::Terminal(cause) => *cause != TerminalCause::PatternMatched,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Option<RegexSet>,
    dlq_internal_errors: bool,
    max_unexpected_error_attempts: u32,
}

impl ErrorClassifier {
    pub fn new(config: &TaskConfig) -> Result<Self, regex::Error> {
        let patterns = if config.dlq_error_patterns.is_empty() {
            None
        } else {
            Some(RegexSet::new(&config.dlq_error_patterns)?)
        };
        Ok(Self {
            patterns,
            dlq_internal_errors: config.dlq_internal_errors,
            max_unexpected_error_attempts: config.max_unexpected_error_attempts,
        })
    }

    /// Classify `err`, given how many unexpected errors the task already had.
    pub fn classify(&self, err: &TaskError, prior_unexpected_attempts: u32) -> Classification {
        if let Some(patterns) = &self.patterns {
            if patterns.is_match(&err.to_string()) {
                return Classification::Terminal(TerminalCause::PatternMatched);
            }
        }

        match err {
            TaskError::StaleReference(_) => return Classification::SafeDrop(DropReason::StaleReference),
            TaskError::NotFound(_) => return Classification::SafeDrop(DropReason::NotFound),
            TaskError::NamespaceDeleted(_) => {
                return Classification::SafeDrop(DropReason::NamespaceDeleted)
            }
            TaskError::Discarded(_) => return Classification::SafeDrop(DropReason::Discarded),
            TaskError::VersionMismatch(_) => {
                return Classification::SafeDrop(DropReason::VersionMismatch)
            }
            _ => {}
        }

        match err {
            TaskError::ResourceExhausted { cause, .. } => {
                return Classification::Retryable(RetryKind::ResourceExhausted(*cause))
            }
            TaskError::NamespaceNotActive(_) => {
                return Classification::Retryable(RetryKind::NamespaceNotActive)
            }
            TaskError::DependencyNotCompleted(_) => {
                return Classification::Retryable(RetryKind::DependencyNotCompleted)
            }
            TaskError::StandbyRetry(_) => return Classification::Retryable(RetryKind::StandbyRetry),
            TaskError::NamespaceHandover(_) => {
                return Classification::Retryable(RetryKind::NamespaceHandover)
            }
            TaskError::ShardOwnershipLost(_) => {
                return Classification::Retryable(RetryKind::ShardOwnershipLost)
            }
            TaskError::DlqWrite(_) => return Classification::Retryable(RetryKind::DlqWrite),
            TaskError::DestinationDown(inner) => {
                return self.classify(inner, prior_unexpected_attempts)
            }
            _ => {}
        }

        match err {
            TaskError::NonRetryable(_) | TaskError::TerminalFailure(_) => {
                return Classification::Terminal(TerminalCause::NonRetryable)
            }
            TaskError::DataLoss(_) => return Classification::Terminal(TerminalCause::DataLoss),
            TaskError::Internal(_) if self.dlq_internal_errors => {
                return Classification::Terminal(TerminalCause::InternalError)
            }
            _ => {}
        }

        if prior_unexpected_attempts + 1 >= self.max_unexpected_error_attempts {
            return Classification::Terminal(TerminalCause::UnexpectedAttemptsExceeded);
        }
        Classification::Retryable(RetryKind::Unexpected)
    }
}
