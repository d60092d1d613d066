//! Error types for ring event records.

use thiserror::Error;

/// Errors raised while encoding or decoding ring event records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The buffer ended before a complete record could be read.
    #[error("incomplete event record: expected {expected} bytes, got {actual}")]
    IncompleteRecord { expected: usize, actual: usize },

    /// An update carried more components than a tunable can have.
    #[error("invalid arity {0}: tunables have 1 to 3 components")]
    InvalidArity(usize),
}
