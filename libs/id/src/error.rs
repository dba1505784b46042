//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The task ID is missing the `:` between project and service.
    #[error("task ID missing ':' separator")]
    MissingOwnerSeparator,

    /// The task ID is missing the `.` before the ULID.
    #[error("task ID missing '.' separator")]
    MissingSeparator,

    /// A project or service name contains characters outside its alphabet.
    #[error("invalid {kind} name '{value}'")]
    InvalidName { kind: &'static str, value: String },

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error was caused by a bad project or service name.
    pub fn is_name_error(&self) -> bool {
        matches!(self, IdError::InvalidName { .. })
    }
}
