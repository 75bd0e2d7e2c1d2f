use std::fmt;

use object::Value;

/// Recoverable failures surfaced to the embedder.
///
/// Invariant violations are not represented here; they panic with a
/// `fatal:` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Object space or table backing budget exhausted. Never retried here.
    OutOfMemory { what: &'static str, requested: usize },
    /// Global handle was destroyed or never existed.
    InvalidHandle,
    /// Value does not reference a weak collection.
    NotACollection(Value),
    /// Value does not reference a live object.
    InvalidReference(Value),
    /// Value does not reference an object with the given field.
    InvalidSlot { object: Value, slot: u32 },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory { what, requested } => {
                write!(f, "out of memory allocating {what} ({requested} requested)")
            }
            HeapError::InvalidHandle => write!(f, "invalid global handle"),
            HeapError::NotACollection(value) => {
                write!(f, "{value:?} is not a weak collection")
            }
            HeapError::InvalidReference(value) => {
                write!(f, "{value:?} does not reference a live object")
            }
            HeapError::InvalidSlot { object, slot } => {
                write!(f, "{object:?} has no field {slot}")
            }
        }
    }
}

impl std::error::Error for HeapError {}

/// A heap verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub message: String,
}

impl VerifyError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap verification failed: {}", self.message)
    }
}

impl std::error::Error for VerifyError {}
