//! Error types for id parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating ids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("id cannot be empty")]
    Empty,

    /// The id is missing a required separator.
    #[error("id missing '{separator}' separator")]
    MissingSeparator { separator: char },

    /// A character is not allowed at this position.
    #[error("invalid id format: {message}")]
    InvalidFormat { message: String },

    /// The ULID portion of the id is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The numeric portion of the id is invalid.
    #[error("invalid number in id: {0}")]
    InvalidNumber(String),
}

impl IdError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        IdError::InvalidFormat {
            message: message.into(),
        }
    }
}
