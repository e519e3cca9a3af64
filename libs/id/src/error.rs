//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID contains whitespace or a control character.
    #[error("ID contains invalid character {ch:?} at byte {index}")]
    InvalidCharacter { ch: char, index: usize },

    /// The ID is longer than storage and wire formats allow.
    #[error("ID too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
