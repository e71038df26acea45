//! Error taxonomy shared by every layer.

use thiserror::Error;

/// Result type used by collaborator-facing helpers.
pub type EdasResult<T> = Result<T, EdasError>;

/// Severity class of a failure.
///
/// - `Base`: an unexpected internal condition (logged with a stack).
/// - `Warning`: expected but noteworthy; logged at warn level, never with a stack.
/// - `Error`: a configuration or contract violation; the offending operation is
///   aborted, the process continues.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Base,
    Warning,
    Error,
}

impl ErrorKind {
    /// Log level records of this kind are emitted at.
    pub fn level(self) -> tracing::Level {
        match self {
            ErrorKind::Warning => tracing::Level::WARN,
            ErrorKind::Base | ErrorKind::Error => tracing::Level::ERROR,
        }
    }

    /// Whether records of this kind carry a stack.
    pub fn wants_stack(self) -> bool {
        !matches!(self, ErrorKind::Warning)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ErrorKind::Base => "base",
            ErrorKind::Warning => "warning",
            ErrorKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Umbrella error for collaborator code that needs a single type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct EdasError {
    kind: ErrorKind,
    message: String,
}

impl EdasError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn base(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Base, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An app or event identifier failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{what} `{value}` must not contain `::`")]
    ContainsSeparator { what: &'static str, value: String },

    #[error("`{0}` is not of the form app::event_name")]
    Malformed(String),
}

impl NameError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Error
    }
}

impl From<NameError> for EdasError {
    fn from(value: NameError) -> Self {
        EdasError::new(value.kind(), value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_log_without_stack() {
        assert_eq!(ErrorKind::Warning.level(), tracing::Level::WARN);
        assert!(!ErrorKind::Warning.wants_stack());
        assert!(ErrorKind::Error.wants_stack());
        assert!(ErrorKind::Base.wants_stack());
    }

    #[test]
    fn name_errors_are_contract_violations() {
        let err: EdasError = NameError::Empty("event name").into();
        assert_eq!(err.kind(), ErrorKind::Error);
        assert_eq!(err.to_string(), "error: event name must not be empty");
    }
}
