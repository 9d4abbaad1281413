//! Error vocabulary shared by the engine, server, and CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error kinds surfaced by the orchestration core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ParseError,
    ValidationError,
    UnknownPlugin,
    TemplateError,
    SaveMissing,
    AssertionFailed,
    StepTimeout,
    PluginError,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the workflow may retry a step that failed with this kind.
    ///
    /// Deterministic failures (bad templates, failed assertions, missing
    /// required saves, unknown plugins, validation) never retry; a retry
    /// would replay the identical inputs and fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::StepTimeout | ErrorKind::PluginError | ErrorKind::Internal => true,
            ErrorKind::ParseError
            | ErrorKind::ValidationError
            | ErrorKind::UnknownPlugin
            | ErrorKind::TemplateError
            | ErrorKind::SaveMissing
            | ErrorKind::AssertionFailed
            | ErrorKind::Cancelled => false,
        }
    }

    /// The SCREAMING_SNAKE_CASE wire name, as used in `non_retryable_errors`
    /// lists and RPC payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::UnknownPlugin => "UNKNOWN_PLUGIN",
            ErrorKind::TemplateError => "TEMPLATE_ERROR",
            ErrorKind::SaveMissing => "SAVE_MISSING",
            ErrorKind::AssertionFailed => "ASSERTION_FAILED",
            ErrorKind::StepTimeout => "STEP_TIMEOUT",
            ErrorKind::PluginError => "PLUGIN_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A classified core error: one [`ErrorKind`] plus a human-readable message.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a `TEMPLATE_ERROR`.
    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateError, message)
    }

    /// Shorthand for a `PLUGIN_ERROR`.
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginError, message)
    }

    /// Shorthand for an `INTERNAL` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether the retry policy may re-attempt this failure, given the
    /// step's `non_retryable_errors` list.
    pub fn is_retryable_under(&self, non_retryable: &[String]) -> bool {
        if !self.kind.is_retryable() {
            return false;
        }
        !non_retryable.iter().any(|name| name == self.kind.as_str())
    }
}

/// One finding reported by the suite validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    /// Location of the finding, e.g. `tests[0].steps[2].retry`.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Issue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {}", self.path, self.message)
    }
}
