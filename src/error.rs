//! Error types for the Lyra VM crate.
//!
//! This module provides error handling for VM operations, covering the
//! exception kinds the interpreter can raise, bytecode decoding failures,
//! and resource limit violations.

use thiserror::Error;

/// VM execution errors.
///
/// Every variant that corresponds to a script-visible exception kind
/// (`TypeError`, `ReferenceError`, `RangeError`, `SyntaxError`) is paired
/// with an exception value placed in the interpreter's scratch return slot
/// before the unwinder runs, so `try`/`catch` can observe it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Type error: wrong kind of value for an operation
    #[error("TypeError: {message}")]
    Type { message: String },

    /// Reference error: use of an undefined binding
    #[error("ReferenceError: {message}")]
    Reference { message: String },

    /// Range error: value outside the permitted range
    #[error("RangeError: {message}")]
    Range { message: String },

    /// Syntax error surfaced by a host hook
    #[error("SyntaxError: {message}")]
    Syntax { message: String },

    /// Memory allocation failure or memory budget exhaustion
    #[error("MemoryError: {message}")]
    Memory { message: String },

    /// Internal error: unreachable state or ill-formed bytecode
    #[error("InternalError: {message}")]
    Internal { message: String },

    /// A thrown value crossed the script-to-host boundary uncaught
    #[error("uncaught exception: {rendering}")]
    UncaughtException { rendering: String },

    /// Invalid jump offset
    #[error("invalid jump target: {0}")]
    InvalidJump(i64),

    /// Nesting depth of `try` regions exceeded the configured limit
    #[error("maximum try nesting depth exceeded")]
    MaxTryNestingDepthExceeded,
}

impl VmError {
    /// Creates a new type error.
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Creates a new reference error.
    pub fn reference_error<S: Into<String>>(message: S) -> Self {
        Self::Reference {
            message: message.into(),
        }
    }

    /// Creates a new range error.
    pub fn range_error<S: Into<String>>(message: S) -> Self {
        Self::Range {
            message: message.into(),
        }
    }

    /// Creates a new syntax error.
    pub fn syntax_error<S: Into<String>>(message: S) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }

    /// Creates a new memory error.
    pub fn memory_error<S: Into<String>>(message: S) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The exception constructor name for this error, when the error maps to
    /// a script-visible exception kind.
    pub fn exception_name(&self) -> Option<&'static str> {
        match self {
            VmError::Type { .. } => Some("TypeError"),
            VmError::Reference { .. } => Some("ReferenceError"),
            VmError::Range { .. } => Some("RangeError"),
            VmError::Syntax { .. } => Some("SyntaxError"),
            VmError::Memory { .. } => Some("MemoryError"),
            VmError::Internal { .. } => Some("InternalError"),
            _ => None,
        }
    }

    /// Returns the exception message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            VmError::Type { message }
            | VmError::Reference { message }
            | VmError::Range { message }
            | VmError::Syntax { message }
            | VmError::Memory { message }
            | VmError::Internal { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Checks if this error is a resource limit error.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            VmError::Memory { .. } | VmError::MaxTryNestingDepthExceeded
        )
    }

    /// Gets the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            VmError::Type { .. } => "type",
            VmError::Reference { .. } => "reference",
            VmError::Range { .. } => "range",
            VmError::Syntax { .. } => "syntax",
            VmError::Memory { .. } => "memory",
            VmError::Internal { .. } => "internal",
            VmError::UncaughtException { .. } => "throw",
            VmError::InvalidJump(_) => "jump",
            VmError::MaxTryNestingDepthExceeded => "try",
        }
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rendering() {
        let error = VmError::type_error("undefined is not a function");
        assert_eq!(error.to_string(), "TypeError: undefined is not a function");
        assert_eq!(error.exception_name(), Some("TypeError"));
        assert_eq!(error.message(), "undefined is not a function");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(VmError::type_error("x").category(), "type");
        assert_eq!(VmError::reference_error("x").category(), "reference");
        assert_eq!(VmError::internal("x").category(), "internal");
        assert_eq!(VmError::InvalidJump(-3).category(), "jump");
    }

    #[test]
    fn test_resource_limit_classification() {
        assert!(VmError::memory_error("pool exhausted").is_resource_limit());
        assert!(VmError::MaxTryNestingDepthExceeded.is_resource_limit());
        assert!(!VmError::type_error("x").is_resource_limit());
    }
}
